// ── Load-aware service selection ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::RegisteredService;

/// How [`select_best`](super::ServiceRegistry::select_best) picks among
/// healthy candidates of one type.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum SelectionStrategy {
    /// Lowest priority value wins.
    #[default]
    Priority,
    /// Fewest live connections wins; priority breaks ties.
    #[serde(alias = "least_connections")]
    #[strum(to_string = "least-connections", serialize = "least_connections")]
    LeastConnections,
    /// Rotate through candidates in id order.
    #[serde(alias = "round_robin")]
    #[strum(to_string = "round-robin", serialize = "round_robin")]
    RoundRobin,
}

/// Index of the chosen candidate. `candidates` must be sorted by id and
/// already filtered to healthy services of one type; `turn` is the
/// caller's round-robin counter for that type.
pub(crate) fn pick(
    candidates: &[RegisteredService],
    strategy: SelectionStrategy,
    turn: usize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        SelectionStrategy::Priority => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.priority)
            .map(|(i, _)| i),
        SelectionStrategy::LeastConnections => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| (s.connections, s.priority))
            .map(|(i, _)| i),
        SelectionStrategy::RoundRobin => Some(turn % candidates.len()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn svc(id: &str, priority: u32, connections: u64) -> RegisteredService {
        RegisteredService {
            priority,
            connections,
            ..RegisteredService::placeholder(id)
        }
    }

    #[test]
    fn priority_prefers_lowest_value_then_id() {
        let c = [svc("a", 20, 0), svc("b", 10, 9), svc("c", 10, 0)];
        assert_eq!(pick(&c, SelectionStrategy::Priority, 0), Some(1));
    }

    #[test]
    fn least_connections_breaks_ties_by_priority() {
        let c = [svc("a", 20, 1), svc("b", 10, 3), svc("c", 5, 1)];
        assert_eq!(pick(&c, SelectionStrategy::LeastConnections, 0), Some(2));
    }

    #[test]
    fn round_robin_wraps() {
        let c = [svc("a", 1, 0), svc("b", 1, 0), svc("c", 1, 0)];
        let picks: Vec<_> = (0..4)
            .map(|t| pick(&c, SelectionStrategy::RoundRobin, t).unwrap())
            .collect();
        assert_eq!(picks, [0, 1, 2, 0]);
    }

    #[test]
    fn empty_has_no_choice() {
        assert_eq!(pick(&[], SelectionStrategy::RoundRobin, 3), None);
    }

    #[test]
    fn strategy_parses_both_spellings() {
        assert_eq!(
            "least-connections".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LeastConnections
        );
        assert_eq!(
            "round_robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(SelectionStrategy::RoundRobin.to_string(), "round-robin");
    }
}
