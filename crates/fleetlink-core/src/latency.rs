// ── Latency statistics & adaptive timeouts ──
//
// Per (endpoint, operation kind) ring buffer of successful durations.
// Percentiles come from linear interpolation over the sorted buffer; the
// recommended timeout is `clamp(ceil(p95 × safety_factor), min, max)`
// and is recomputed after every sample once enough data exists.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CHANGE_CHANNEL_SIZE: usize = 256;

// ── Operation kinds ──────────────────────────────────────────────────

/// Kind of agent round-trip being timed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    TestPrint,
    PrintJob,
    RawPrint,
    Control,
}

impl OperationKind {
    /// Fixed timeout used until enough samples exist.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::TestPrint => Duration::from_secs(15),
            Self::PrintJob | Self::RawPrint => Duration::from_secs(30),
            Self::Control => Duration::from_secs(10),
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    /// Successful durations kept per key. Oldest evicted first.
    pub capacity: usize,
    pub safety_factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Samples (successes and failures) required before stats exist.
    pub min_samples: u64,
    /// Buffered successful samples required before stats exist.
    pub min_successful: usize,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            capacity: 1000,
            safety_factor: 1.5,
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(120),
            min_samples: 10,
            min_successful: 5,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────

/// Derived statistics; all durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub total_samples: u64,
    pub successful_samples: u64,
    pub buffered: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub stdev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Successful share of all recorded samples, 0.0–1.0.
    pub success_rate: f64,
    #[serde(with = "duration_ms")]
    pub recommended_timeout: Duration,
}

/// Stats for one key, as returned by [`LatencyTracker::all_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointLatency {
    pub endpoint: String,
    pub kind: OperationKind,
    pub stats: LatencyStats,
}

/// Published whenever a key's recommended timeout changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutChange {
    pub endpoint: String,
    pub kind: OperationKind,
    pub previous: Option<Duration>,
    pub current: Duration,
}

#[derive(Debug, Default)]
struct LatencyRecord {
    durations: VecDeque<f64>,
    total: u64,
    successful: u64,
    recommended: Option<Duration>,
}

impl LatencyRecord {
    #[allow(clippy::cast_precision_loss)]
    fn stats(&self, policy: &TimeoutPolicy) -> Option<LatencyStats> {
        if self.total < policy.min_samples || self.durations.len() < policy.min_successful {
            return None;
        }

        let mut sorted: Vec<f64> = self.durations.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        let p95 = percentile(&sorted, 95.0);

        Some(LatencyStats {
            total_samples: self.total,
            successful_samples: self.successful,
            buffered: sorted.len(),
            mean_ms: mean,
            median_ms: percentile(&sorted, 50.0),
            p50_ms: percentile(&sorted, 50.0),
            p75_ms: percentile(&sorted, 75.0),
            p90_ms: percentile(&sorted, 90.0),
            p95_ms: p95,
            p99_ms: percentile(&sorted, 99.0),
            stdev_ms: variance.sqrt(),
            min_ms: sorted.first().copied().unwrap_or_default(),
            max_ms: sorted.last().copied().unwrap_or_default(),
            success_rate: self.successful as f64 / self.total as f64,
            recommended_timeout: recommend(p95, policy),
        })
    }
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn recommend(p95_ms: f64, policy: &TimeoutPolicy) -> Duration {
    let millis = (p95_ms * policy.safety_factor).ceil().max(0.0) as u64;
    // Bounds are ordered by `LatencyTracker::new`.
    Duration::from_millis(millis)
        .max(policy.min_timeout)
        .min(policy.max_timeout)
}

// ── Tracker ──────────────────────────────────────────────────────────

/// Records operation latencies and derives per-endpoint timeouts.
pub struct LatencyTracker {
    records: DashMap<(String, OperationKind), LatencyRecord>,
    policy: TimeoutPolicy,
    changes: broadcast::Sender<TimeoutChange>,
}

impl LatencyTracker {
    pub fn new(mut policy: TimeoutPolicy) -> Self {
        if policy.min_timeout > policy.max_timeout {
            warn!(
                min = ?policy.min_timeout,
                max = ?policy.max_timeout,
                "timeout bounds inverted, swapping"
            );
            std::mem::swap(&mut policy.min_timeout, &mut policy.max_timeout);
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            records: DashMap::new(),
            policy,
            changes,
        }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Record one completed operation. Only successful durations enter
    /// the buffer; failures still count toward the sample total.
    pub fn record(&self, endpoint: &str, kind: OperationKind, duration: Duration, success: bool) {
        let change = {
            let mut record = self
                .records
                .entry((endpoint.to_owned(), kind))
                .or_default();

            record.total += 1;
            if success {
                record.successful += 1;
                if record.durations.len() >= self.policy.capacity {
                    record.durations.pop_front();
                }
                record.durations.push_back(duration.as_secs_f64() * 1000.0);
            }

            let Some(stats) = record.stats(&self.policy) else {
                return;
            };
            let previous = record.recommended;
            if previous == Some(stats.recommended_timeout) {
                return;
            }
            record.recommended = Some(stats.recommended_timeout);
            TimeoutChange {
                endpoint: endpoint.to_owned(),
                kind,
                previous,
                current: stats.recommended_timeout,
            }
        };

        match change.previous {
            None => info!(
                endpoint,
                %kind,
                timeout = %humantime::format_duration(change.current),
                "adaptive timeout established"
            ),
            Some(previous) => debug!(
                endpoint,
                %kind,
                from = %humantime::format_duration(previous),
                to = %humantime::format_duration(change.current),
                "adaptive timeout changed"
            ),
        }
        let _ = self.changes.send(change);
    }

    /// Timeout to use for the next call: the recommendation once enough
    /// data exists, the kind's fixed default before that.
    pub fn timeout(&self, endpoint: &str, kind: OperationKind) -> Duration {
        self.records
            .get(&(endpoint.to_owned(), kind))
            .and_then(|r| r.recommended)
            .unwrap_or_else(|| kind.default_timeout())
    }

    pub fn stats(&self, endpoint: &str, kind: OperationKind) -> Option<LatencyStats> {
        self.records
            .get(&(endpoint.to_owned(), kind))
            .and_then(|r| r.stats(&self.policy))
    }

    /// Stats for every key that has enough data, sorted by endpoint then kind.
    pub fn all_stats(&self) -> Vec<EndpointLatency> {
        let mut all: Vec<EndpointLatency> = self
            .records
            .iter()
            .filter_map(|entry| {
                let (endpoint, kind) = entry.key();
                entry.stats(&self.policy).map(|stats| EndpointLatency {
                    endpoint: endpoint.clone(),
                    kind: *kind,
                    stats,
                })
            })
            .collect();
        all.sort_by(|a, b| (&a.endpoint, a.kind).cmp(&(&b.endpoint, b.kind)));
        all
    }

    /// Drop all history for an endpoint. Returns the number of keys removed.
    pub fn clear(&self, endpoint: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|(e, _), _| e != endpoint);
        before - self.records.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimeoutChange> {
        self.changes.subscribe()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(TimeoutPolicy::default())
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
