// ── Printer domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fleetlink_api::PrinterState;

/// Paper level assumed for a printer that has not reported one.
pub const FULL_PAPER: u8 = 100;

/// Gateway-side view of one physical printer.
///
/// Created on first sight (discovery, status report or explicit
/// registration) and retained for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterStatus {
    pub id: String,
    pub company_id: String,
    pub branch_id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub status: PrinterState,
    /// 0–100.
    pub paper_level: u8,
    /// Degrees Celsius.
    pub temperature: f32,
    pub queue_length: u32,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub error_jobs: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_type: Option<String>,
    pub capabilities: Vec<String>,
}

impl PrinterStatus {
    pub fn new(
        id: impl Into<String>,
        company_id: impl Into<String>,
        branch_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            company_id: company_id.into(),
            branch_id: branch_id.into(),
            name: None,
            model: None,
            status: PrinterState::Offline,
            paper_level: FULL_PAPER,
            temperature: 0.0,
            queue_length: 0,
            total_jobs: 0,
            completed_jobs: 0,
            error_jobs: 0,
            last_seen: None,
            connection_type: None,
            capabilities: Vec::new(),
        }
    }

    /// Failed share of finished jobs, once any exist.
    #[allow(clippy::cast_precision_loss)]
    pub fn error_ratio(&self) -> Option<f64> {
        (self.total_jobs > 0).then(|| self.error_jobs as f64 / self.total_jobs as f64)
    }

    /// Whether the printer can take work right now.
    pub fn is_available(&self) -> bool {
        matches!(self.status, PrinterState::Online | PrinterState::LowPaper)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Explicit registration of a printer found outside the agent's own
/// discovery loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterRegistration {
    pub printer_id: String,
    pub company_id: String,
    pub branch_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub connection_type: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_printer_is_offline_with_full_paper() {
        let p = PrinterStatus::new("p1", "acme", "b1");
        assert_eq!(p.status, PrinterState::Offline);
        assert_eq!(p.paper_level, FULL_PAPER);
        assert!(p.error_ratio().is_none());
        assert_eq!(p.display_name(), "p1");
    }

    #[test]
    fn error_ratio_over_total_jobs() {
        let mut p = PrinterStatus::new("p1", "acme", "b1");
        p.total_jobs = 8;
        p.error_jobs = 2;
        assert_eq!(p.error_ratio(), Some(0.25));
    }
}
