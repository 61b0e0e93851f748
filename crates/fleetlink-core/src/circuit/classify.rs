// ── Error classification ──
//
// Sorts failure messages into retryable and non-retryable buckets by
// case-insensitive substring match. Status codes match only as whole
// words. Classification feeds metrics and retry decisions; it never
// changes circuit transitions.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Retryability of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Network trouble, timeouts, busy or unavailable endpoints.
    Transient,
    /// Bad input, missing resources, rejected credentials.
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self != Self::Permanent
    }
}

/// Fragments that mark a failure as worth retrying.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "did not respond",
    "etimedout",
    "econnrefused",
    "econnreset",
    "econnaborted",
    "ehostunreach",
    "enetunreach",
    "epipe",
    "enotfound",
    "connection refused",
    "connection reset",
    "connection closed",
    "socket hang up",
    "network",
    "unavailable",
    "unreachable",
    "temporarily",
    "try again",
    "busy",
    "offline",
    "no agent",
    "rate limit",
    "too many requests",
    "out of paper",
    "paper jam",
    "cover open",
];

/// Status codes that mark a failure as worth retrying.
const TRANSIENT_CODES: &[&str] = &["502", "503", "504", "429"];

/// Fragments that mark a failure as permanent.
const PERMANENT_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "permission denied",
    "access denied",
    "invalid",
    "validation",
    "malformed",
    "bad request",
    "not found",
    "does not exist",
    "unsupported",
    "not supported",
];

/// Status codes that mark a failure as permanent.
const PERMANENT_CODES: &[&str] = &["400", "401", "403", "404", "422"];

/// Classify a failure message.
///
/// Transient patterns win over permanent ones, so "service unavailable
/// (invalid upstream)" stays retryable.
pub fn classify(message: &str) -> ErrorClass {
    let lowered = message.to_ascii_lowercase();

    let matches = |patterns: &[&str], codes: &[&str]| {
        patterns.iter().any(|p| lowered.contains(p))
            || codes.iter().any(|c| contains_word(&lowered, c))
    };

    if matches(TRANSIENT_PATTERNS, TRANSIENT_CODES) {
        ErrorClass::Transient
    } else if matches(PERMANENT_PATTERNS, PERMANENT_CODES) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}

/// `needle` occurs in `haystack` with no alphanumeric neighbour on
/// either side.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let bytes = haystack.as_bytes();
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before = start.checked_sub(1).and_then(|i| bytes.get(i));
        let after = bytes.get(end);
        !before.is_some_and(u8::is_ascii_alphanumeric) && !after.is_some_and(u8::is_ascii_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        for msg in [
            "connect ECONNREFUSED 10.0.0.5:9100",
            "Request timed out",
            "Agent connected but did not respond to test_print within 15.0s",
            "Service Unavailable",
            "HTTP 503",
            "printer busy",
        ] {
            assert_eq!(classify(msg), ErrorClass::Transient, "{msg}");
        }
    }

    #[test]
    fn input_and_auth_failures_are_permanent() {
        for msg in [
            "Printer not found",
            "Invalid ESC/POS payload",
            "401 Unauthorized",
            "Forbidden",
            "validation failed: copies must be positive",
        ] {
            assert_eq!(classify(msg), ErrorClass::Permanent, "{msg}");
        }
    }

    #[test]
    fn transient_wins_over_permanent() {
        assert_eq!(
            classify("upstream unavailable: invalid gateway"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn status_codes_match_whole_words_only() {
        assert_eq!(classify("status 503 from upstream"), ErrorClass::Transient);
        assert_eq!(classify("HTTP/1.1 404"), ErrorClass::Permanent);
        assert_eq!(classify("(429)"), ErrorClass::Transient);

        assert_eq!(classify("job 45034 failed to render"), ErrorClass::Unknown);
        assert_eq!(classify("printer id p4001 stalled"), ErrorClass::Unknown);
        assert_eq!(classify("order 1400 rejected by printer"), ErrorClass::Unknown);
    }

    #[test]
    fn unmatched_is_unknown() {
        assert_eq!(classify("something odd happened"), ErrorClass::Unknown);
        assert!(ErrorClass::Unknown.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
    }

    #[test]
    fn display_is_screaming_case() {
        assert_eq!(ErrorClass::Transient.to_string(), "TRANSIENT");
    }
}
