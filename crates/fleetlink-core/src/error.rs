// ── Core error types ──
//
// User-facing errors from fleetlink-core. Transport details from
// fleetlink-api are translated into domain variants at the boundary.
// The three dispatch failures (no agent / timeout / circuit open) carry
// distinct messages because each one calls for a different remedy.

use std::time::Duration;

use thiserror::Error;

use crate::circuit::ErrorClass;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Dispatch errors ──────────────────────────────────────────────
    #[error("No print agent connected for branch {branch_id}: start the desktop app at that branch")]
    NoAgentConnected { branch_id: String },

    #[error("Agent connected but did not respond to {operation} within {:.1}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("Service unavailable for {endpoint}: circuit open, retry in {:.1}s", .retry_in.as_secs_f64())]
    CircuitOpen { endpoint: String, retry_in: Duration },

    #[error("{operation} failed on {endpoint}: {message}")]
    OperationFailed {
        endpoint: String,
        operation: String,
        message: String,
        class: ErrorClass,
    },

    #[error("Request {correlation_id} was abandoned before a reply arrived")]
    Abandoned { correlation_id: uuid::Uuid },

    // ── Registry errors ──────────────────────────────────────────────
    #[error("Service not registered: {id}")]
    ServiceNotFound { id: String },

    #[error("No healthy {service_type} service available")]
    NoHealthyService { service_type: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Printer not found: {printer_id}")]
    PrinterNotFound { printer_id: String },

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    // ── Infrastructure errors ────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(#[from] fleetlink_api::Error),

    #[error("Service advertisement failed: {reason}")]
    Advertise { reason: String },

    #[error("Fleet is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, used in structured outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAgentConnected { .. } => "no_agent_connected",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::OperationFailed { .. } => "operation_failed",
            Self::Abandoned { .. } => "abandoned",
            Self::ServiceNotFound { .. } => "registry_not_found",
            Self::NoHealthyService { .. } => "no_healthy_service",
            Self::PrinterNotFound { .. } => "printer_not_found",
            Self::Validation { .. } => "validation",
            Self::Transport(_) => "transport",
            Self::Advertise { .. } => "advertise",
            Self::NotRunning => "not_running",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this failure reflects endpoint misbehavior and should
    /// count against the endpoint's circuit.
    ///
    /// Topology problems (no agent) and the breaker's own rejections
    /// say nothing about the printer.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::OperationFailed { .. })
    }

    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::CircuitOpen { .. }
            | Self::NoAgentConnected { .. }
            | Self::NoHealthyService { .. } => true,
            Self::OperationFailed { class, .. } => *class != ErrorClass::Permanent,
            Self::Transport(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_failures_are_distinguishable() {
        let none = CoreError::NoAgentConnected {
            branch_id: "b1".into(),
        };
        let slow = CoreError::Timeout {
            operation: "test_print".into(),
            after: Duration::from_secs(15),
        };
        let open = CoreError::CircuitOpen {
            endpoint: "p1".into(),
            retry_in: Duration::from_millis(500),
        };

        assert!(none.to_string().contains("start the desktop app"));
        assert!(slow.to_string().contains("did not respond"));
        assert!(slow.to_string().contains("15.0s"));
        assert!(open.to_string().contains("retry in 0.5s"));
    }

    #[test]
    fn only_endpoint_failures_count_against_circuit() {
        assert!(
            !CoreError::NoAgentConnected {
                branch_id: "b".into()
            }
            .counts_against_circuit()
        );
        assert!(
            CoreError::Timeout {
                operation: "x".into(),
                after: Duration::from_secs(1)
            }
            .counts_against_circuit()
        );
        assert!(
            !CoreError::CircuitOpen {
                endpoint: "p".into(),
                retry_in: Duration::ZERO
            }
            .counts_against_circuit()
        );
    }

    #[test]
    fn permanent_operation_failures_are_not_retryable() {
        let err = CoreError::OperationFailed {
            endpoint: "p".into(),
            operation: "print_job".into(),
            message: "printer not found".into(),
            class: ErrorClass::Permanent,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "operation_failed");
    }
}
