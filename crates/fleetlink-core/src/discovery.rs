// ── Discovery heartbeat aggregator ──
//
// Heartbeats from agents' discovery services are appended per branch and
// pruned once older than the retention window. Branch and company health
// is always derived from the newest records, never stored.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetlink_api::protocol::{HeartbeatReport, SystemReport};
use serde::Serialize;
use strum::Display;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{SharedClock, chrono_duration, saturating_before};
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Records older than this are pruned. Default: 24h.
    pub retention: Duration,
    /// Newest heartbeat younger than this means "alive". Default: 2 min.
    pub alive_threshold: Duration,
    /// Newest heartbeat younger than this counts toward trends. Default: 5 min.
    pub recent_threshold: Duration,
    /// Records kept per branch before the oldest are dropped.
    pub per_branch_cap: usize,
    /// How often the supervisor prunes.
    pub prune_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            alive_threshold: Duration::from_secs(2 * 60),
            recent_threshold: Duration::from_secs(5 * 60),
            per_branch_cap: 5000,
            prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// One stored heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryHeartbeat {
    pub id: Uuid,
    pub company_id: String,
    pub branch_id: String,
    pub device_id: Option<String>,
    pub app_version: String,
    pub discovery_running: bool,
    pub cached_printers: u32,
    pub total_cycles: u64,
    pub error_count: u64,
    pub system: Option<SystemReport>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthVerdict {
    /// No branch has ever reported.
    Unknown,
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyStats {
    pub company_id: String,
    pub total_branches: usize,
    /// Branches with a heartbeat inside the alive threshold.
    pub active_branches: usize,
    /// Branches with a heartbeat inside the recent threshold.
    pub recent_branches: usize,
    /// Sum of cached printers over recent branches.
    pub cached_printers: u64,
    pub health: HealthVerdict,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStatus {
    pub company_id: String,
    pub branch_id: String,
    pub alive: bool,
    pub records: usize,
    pub latest: DiscoveryHeartbeat,
}

type BranchKey = (String, String);

/// Stores and summarizes discovery heartbeats.
pub struct HeartbeatAggregator {
    branches: DashMap<BranchKey, VecDeque<DiscoveryHeartbeat>>,
    config: DiscoveryConfig,
    clock: SharedClock,
}

impl HeartbeatAggregator {
    pub fn new(config: DiscoveryConfig, clock: SharedClock) -> Self {
        Self {
            branches: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Store a heartbeat. Company and branch must be present; the gateway
    /// fills them from the connection's handshake when the agent omits them.
    pub fn ingest(&self, report: &HeartbeatReport) -> Result<DiscoveryHeartbeat, CoreError> {
        let company_id = required(report.company_id.as_deref(), "companyId")?;
        let branch_id = required(report.branch_id.as_deref(), "branchId")?;

        let record = DiscoveryHeartbeat {
            id: Uuid::new_v4(),
            company_id: company_id.to_owned(),
            branch_id: branch_id.to_owned(),
            device_id: report.device_id.clone(),
            app_version: report.app_version.clone(),
            discovery_running: report.discovery_running,
            cached_printers: report.cached_printers,
            total_cycles: report.total_cycles,
            error_count: report.error_count,
            system: report.system.clone(),
            received_at: self.clock.now(),
        };

        let mut history = self
            .branches
            .entry((record.company_id.clone(), record.branch_id.clone()))
            .or_default();
        history.push_back(record.clone());
        while history.len() > self.config.per_branch_cap {
            history.pop_front();
        }
        drop(history);

        debug!(
            company_id,
            branch_id,
            cached_printers = record.cached_printers,
            running = record.discovery_running,
            "discovery heartbeat"
        );
        Ok(record)
    }

    /// Records for a branch inside `window`, newest first, at most `limit`.
    pub fn history(
        &self,
        branch_id: &str,
        company_id: &str,
        limit: usize,
        window: Duration,
    ) -> Vec<DiscoveryHeartbeat> {
        let cutoff = saturating_before(self.clock.now(), window);
        self.branches
            .get(&key(company_id, branch_id))
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take_while(|h| h.received_at >= cutoff)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn latest(&self, branch_id: &str, company_id: &str) -> Option<DiscoveryHeartbeat> {
        self.branches
            .get(&key(company_id, branch_id))
            .and_then(|h| h.back().cloned())
    }

    /// Whether the branch's newest heartbeat is younger than `threshold`.
    pub fn is_alive(&self, branch_id: &str, company_id: &str, threshold: Duration) -> bool {
        let now = self.clock.now();
        self.latest(branch_id, company_id)
            .is_some_and(|h| now - h.received_at < chrono_duration(threshold))
    }

    pub fn branch_status(&self, branch_id: &str, company_id: &str) -> Option<BranchStatus> {
        let now = self.clock.now();
        let alive = chrono_duration(self.config.alive_threshold);
        let history = self.branches.get(&key(company_id, branch_id))?;
        let latest = history.back()?.clone();
        Some(BranchStatus {
            company_id: company_id.to_owned(),
            branch_id: branch_id.to_owned(),
            alive: now - latest.received_at < alive,
            records: history.len(),
            latest,
        })
    }

    pub fn company_stats(&self, company_id: &str) -> CompanyStats {
        let now = self.clock.now();
        let alive = chrono_duration(self.config.alive_threshold);
        let recent = chrono_duration(self.config.recent_threshold);

        let mut stats = CompanyStats {
            company_id: company_id.to_owned(),
            total_branches: 0,
            active_branches: 0,
            recent_branches: 0,
            cached_printers: 0,
            health: HealthVerdict::Unknown,
            last_heartbeat: None,
        };

        for entry in &self.branches {
            if entry.key().0 != company_id {
                continue;
            }
            let Some(latest) = entry.value().back() else {
                continue;
            };
            stats.total_branches += 1;
            let age = now - latest.received_at;
            if age < alive {
                stats.active_branches += 1;
            }
            if age < recent {
                stats.recent_branches += 1;
                stats.cached_printers += u64::from(latest.cached_printers);
            }
            stats.last_heartbeat = stats.last_heartbeat.max(Some(latest.received_at));
        }

        stats.health = match (stats.total_branches, stats.active_branches) {
            (0, _) => HealthVerdict::Unknown,
            (total, active) if active == total => HealthVerdict::Healthy,
            (_, 0) => HealthVerdict::Down,
            _ => HealthVerdict::Degraded,
        };
        stats
    }

    /// Drop records older than `age`. Returns the number removed.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let cutoff = saturating_before(self.clock.now(), age);
        let mut removed = 0;

        self.branches.retain(|_, history| {
            while history.front().is_some_and(|h| h.received_at < cutoff) {
                history.pop_front();
                removed += 1;
            }
            !history.is_empty()
        });

        if removed > 0 {
            info!(removed, "pruned discovery heartbeats");
        }
        removed
    }

    /// Prune with the configured retention.
    pub fn prune(&self) -> usize {
        self.prune_older_than(self.config.retention)
    }

    pub fn record_count(&self) -> usize {
        self.branches.iter().map(|h| h.len()).sum()
    }
}

fn key(company_id: &str, branch_id: &str) -> BranchKey {
    (company_id.to_owned(), branch_id.to_owned())
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, CoreError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CoreError::Validation {
            field: field.to_owned(),
            reason: "is required".into(),
        })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn aggregator() -> (HeartbeatAggregator, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        (
            HeartbeatAggregator::new(DiscoveryConfig::default(), clock.clone()),
            clock,
        )
    }

    fn beat(company: &str, branch: &str, cached: u32) -> HeartbeatReport {
        HeartbeatReport {
            company_id: Some(company.into()),
            branch_id: Some(branch.into()),
            device_id: Some("till-1".into()),
            app_version: "2.4.1".into(),
            discovery_running: true,
            cached_printers: cached,
            ..HeartbeatReport::default()
        }
    }

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn ingest_requires_scope() {
        let (agg, _clock) = aggregator();
        let mut report = beat("acme", "b1", 1);
        report.branch_id = None;
        assert!(matches!(
            agg.ingest(&report),
            Err(CoreError::Validation { ref field, .. }) if field == "branchId"
        ));
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let (agg, clock) = aggregator();
        for cached in 0..5 {
            agg.ingest(&beat("acme", "b1", cached)).unwrap();
            clock.advance(mins(30));
        }

        let all = agg.history("b1", "acme", 10, Duration::from_secs(24 * 3600));
        assert_eq!(
            all.iter().map(|h| h.cached_printers).collect::<Vec<_>>(),
            [4, 3, 2, 1, 0]
        );

        let limited = agg.history("b1", "acme", 2, Duration::from_secs(24 * 3600));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].cached_printers, 4);

        // Now 2.5h after the first beat; a 1h window sees the last two.
        let windowed = agg.history("b1", "acme", 10, mins(60));
        assert_eq!(windowed.len(), 2);

        assert!(agg.history("b1", "other-co", 10, mins(60)).is_empty());
    }

    #[test]
    fn aliveness_uses_newest_record() {
        let (agg, clock) = aggregator();
        agg.ingest(&beat("acme", "b1", 3)).unwrap();

        clock.advance(Duration::from_secs(119));
        assert!(agg.is_alive("b1", "acme", mins(2)));
        clock.advance(Duration::from_secs(2));
        assert!(!agg.is_alive("b1", "acme", mins(2)));
        assert!(agg.is_alive("b1", "acme", mins(5)));
        assert!(!agg.is_alive("never", "acme", mins(5)));
    }

    #[test]
    fn company_stats_and_verdicts() {
        let (agg, clock) = aggregator();
        assert_eq!(agg.company_stats("acme").health, HealthVerdict::Unknown);

        agg.ingest(&beat("acme", "b1", 4)).unwrap();
        agg.ingest(&beat("acme", "b2", 6)).unwrap();
        agg.ingest(&beat("other", "x", 100)).unwrap();
        assert_eq!(agg.company_stats("acme").health, HealthVerdict::Healthy);

        clock.advance(mins(3));
        agg.ingest(&beat("acme", "b1", 5)).unwrap();
        let stats = agg.company_stats("acme");
        assert_eq!(stats.total_branches, 2);
        assert_eq!(stats.active_branches, 1);
        assert_eq!(stats.recent_branches, 2);
        assert_eq!(stats.cached_printers, 11);
        assert_eq!(stats.health, HealthVerdict::Degraded);

        clock.advance(mins(4));
        let stats = agg.company_stats("acme");
        assert_eq!(stats.active_branches, 0);
        assert_eq!(stats.recent_branches, 1);
        assert_eq!(stats.cached_printers, 5);
        assert_eq!(stats.health, HealthVerdict::Down);
    }

    #[test]
    fn unbounded_windows_keep_everything() {
        let (agg, _clock) = aggregator();
        agg.ingest(&beat("acme", "b1", 2)).unwrap();

        assert_eq!(agg.history("b1", "acme", 10, Duration::MAX).len(), 1);
        assert_eq!(agg.prune_older_than(Duration::MAX), 0);
        assert_eq!(agg.record_count(), 1);
    }

    #[test]
    fn prune_drops_old_records_and_empty_branches() {
        let (agg, clock) = aggregator();
        agg.ingest(&beat("acme", "old", 1)).unwrap();
        clock.advance(Duration::from_secs(23 * 3600));
        agg.ingest(&beat("acme", "fresh", 1)).unwrap();
        clock.advance(Duration::from_secs(2 * 3600));

        assert_eq!(agg.prune(), 1);
        assert_eq!(agg.record_count(), 1);
        assert!(agg.branch_status("old", "acme").is_none());
        assert!(agg.branch_status("fresh", "acme").is_some());
    }

    #[test]
    fn per_branch_cap_drops_oldest() {
        let clock = ManualClock::starting_now();
        let agg = HeartbeatAggregator::new(
            DiscoveryConfig {
                per_branch_cap: 3,
                ..DiscoveryConfig::default()
            },
            clock,
        );
        for cached in 0..5 {
            agg.ingest(&beat("acme", "b1", cached)).unwrap();
        }
        let status = agg.branch_status("b1", "acme").unwrap();
        assert_eq!(status.records, 3);
        assert_eq!(status.latest.cached_printers, 4);
        assert!(status.alive);
    }
}
