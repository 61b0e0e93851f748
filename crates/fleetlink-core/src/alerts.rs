// ── Printer alert evaluation ──
//
// Periodic pass over the printer snapshot. Alerts are de-duplicated per
// (printer, kind): a condition that persists across passes raises once,
// and the alert is cleared on the first pass where it no longer holds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, chrono_duration};
use crate::model::{Alert, AlertKind, PrinterState, PrinterStatus, Severity};

#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    /// Paper below this percentage raises `low_paper`.
    pub low_paper_percent: u8,
    /// Temperature above this raises `overheating`.
    pub overheat_celsius: f32,
    /// Silence longer than this raises `offline`.
    pub offline_after: Duration,
    /// Error share above this raises `high_error_rate`...
    pub error_ratio: f64,
    /// ...once at least this many jobs ran.
    pub error_min_jobs: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            low_paper_percent: 20,
            overheat_celsius: 65.0,
            offline_after: Duration::from_secs(5 * 60),
            error_ratio: 0.25,
            error_min_jobs: 10,
        }
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertEvaluation {
    pub raised: Vec<Alert>,
    pub cleared: Vec<Alert>,
    /// Status corrections implied by the conditions found.
    pub status_changes: Vec<(String, PrinterState)>,
}

impl AlertEvaluation {
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.cleared.is_empty() && self.status_changes.is_empty()
    }
}

struct Condition {
    kind: AlertKind,
    severity: Severity,
    message: String,
}

pub struct AlertEngine {
    active: DashMap<(String, AlertKind), Alert>,
    thresholds: AlertThresholds,
    clock: SharedClock,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds, clock: SharedClock) -> Self {
        Self {
            active: DashMap::new(),
            thresholds,
            clock,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    fn is_stale(&self, printer: &PrinterStatus, now: DateTime<Utc>) -> bool {
        printer
            .last_seen
            .is_some_and(|seen| now - seen > chrono_duration(self.thresholds.offline_after))
    }

    fn conditions(&self, printer: &PrinterStatus, now: DateTime<Utc>) -> Vec<Condition> {
        let t = &self.thresholds;
        let name = printer.display_name();
        let mut found = Vec::new();

        if printer.paper_level == 0 {
            found.push(Condition {
                kind: AlertKind::NoPaper,
                severity: Severity::Critical,
                message: format!("Printer {name} is out of paper"),
            });
        } else if printer.paper_level < t.low_paper_percent {
            found.push(Condition {
                kind: AlertKind::LowPaper,
                severity: Severity::Warning,
                message: format!("Printer {name} paper low ({}%)", printer.paper_level),
            });
        }

        if printer.temperature > t.overheat_celsius {
            found.push(Condition {
                kind: AlertKind::Overheating,
                severity: Severity::Warning,
                message: format!(
                    "Printer {name} overheating ({:.1}°C)",
                    printer.temperature
                ),
            });
        }

        if let Some(seen) = printer.last_seen {
            if self.is_stale(printer, now) {
                let silent = (now - seen).to_std().unwrap_or_default();
                let silent = Duration::from_secs(silent.as_secs());
                found.push(Condition {
                    kind: AlertKind::Offline,
                    severity: Severity::Warning,
                    message: format!(
                        "Printer {name} not seen for {}",
                        humantime::format_duration(silent)
                    ),
                });
            }
        }

        if printer.total_jobs >= t.error_min_jobs {
            if let Some(ratio) = printer.error_ratio().filter(|r| *r > t.error_ratio) {
                found.push(Condition {
                    kind: AlertKind::HighErrorRate,
                    severity: Severity::Warning,
                    message: format!(
                        "Printer {name} error rate {:.0}% over {} jobs",
                        ratio * 100.0,
                        printer.total_jobs
                    ),
                });
            }
        }

        found
    }

    /// Status a printer should move to given its paper and liveness.
    fn corrected_status(&self, printer: &PrinterStatus, now: DateTime<Utc>) -> Option<PrinterState> {
        if self.is_stale(printer, now) {
            return (printer.status != PrinterState::Offline).then_some(PrinterState::Offline);
        }

        let low = self.thresholds.low_paper_percent;
        let target = match (printer.status, printer.paper_level) {
            (PrinterState::Online | PrinterState::LowPaper, 0) => PrinterState::NoPaper,
            (PrinterState::Online | PrinterState::NoPaper, level) if level > 0 && level < low => {
                PrinterState::LowPaper
            }
            (PrinterState::LowPaper | PrinterState::NoPaper, level) if level >= low => {
                PrinterState::Online
            }
            _ => return None,
        };
        (target != printer.status).then_some(target)
    }

    /// Evaluate every printer once.
    pub fn evaluate(&self, printers: &[Arc<PrinterStatus>]) -> AlertEvaluation {
        let now = self.clock.now();
        let mut out = AlertEvaluation::default();

        for printer in printers {
            let conditions = self.conditions(printer, now);
            let holding: BTreeSet<AlertKind> = conditions.iter().map(|c| c.kind).collect();

            for condition in conditions {
                let key = (printer.id.clone(), condition.kind);
                if self.active.contains_key(&key) {
                    continue;
                }
                let alert = Alert {
                    id: Uuid::new_v4().to_string(),
                    printer_id: printer.id.clone(),
                    company_id: printer.company_id.clone(),
                    branch_id: printer.branch_id.clone(),
                    kind: condition.kind,
                    severity: condition.severity,
                    message: condition.message,
                    raised_at: now,
                };
                warn!(
                    printer_id = %alert.printer_id,
                    kind = %alert.kind,
                    severity = %alert.severity,
                    "{}",
                    alert.message
                );
                self.active.insert(key, alert.clone());
                out.raised.push(alert);
            }

            let resolved: Vec<(String, AlertKind)> = self
                .active
                .iter()
                .filter(|a| a.key().0 == printer.id && !holding.contains(&a.key().1))
                .map(|a| a.key().clone())
                .collect();
            for key in resolved {
                if let Some((_, alert)) = self.active.remove(&key) {
                    info!(printer_id = %alert.printer_id, kind = %alert.kind, "alert cleared");
                    out.cleared.push(alert);
                }
            }

            if let Some(status) = self.corrected_status(printer, now) {
                out.status_changes.push((printer.id.clone(), status));
            }
        }

        out
    }

    /// Active alerts, oldest first.
    pub fn active(&self) -> Vec<Alert> {
        let mut all: Vec<Alert> = self.active.iter().map(|a| a.value().clone()).collect();
        all.sort_by(|a, b| (a.raised_at, &a.id).cmp(&(b.raised_at, &b.id)));
        all
    }

    pub fn active_for(&self, printer_id: &str) -> Vec<Alert> {
        self.active()
            .into_iter()
            .filter(|a| a.printer_id == printer_id)
            .collect()
    }

    /// Drop an alert by hand. It is raised again on the next pass if the
    /// condition still holds.
    pub fn dismiss(&self, printer_id: &str, kind: AlertKind) -> Option<Alert> {
        self.active
            .remove(&(printer_id.to_owned(), kind))
            .map(|(_, alert)| alert)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
