// ── Fleet events ──
//
// Everything the gateway tells the outside world. Observer connections
// receive these as wire frames; in-process subscribers (persistence,
// metrics) receive them from the broadcast channel as-is.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use fleetlink_api::protocol::JobState;

use super::alert::Alert;
use super::printer::PrinterStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    pub printer_id: String,
    pub company_id: String,
    pub branch_id: String,
    pub state: JobState,
    pub error: Option<String>,
}

/// Result of a test print, as seen by the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub printer_id: String,
    pub company_id: String,
    pub branch_id: String,
    pub success: bool,
    pub message: String,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub company_id: String,
    pub branch_id: String,
    pub device_id: Option<String>,
    pub connected: bool,
    pub agents_in_branch: usize,
}

/// Point-in-time fleet analytics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub total_printers: usize,
    pub online: usize,
    pub offline: usize,
    pub busy: usize,
    pub error: usize,
    pub low_paper: usize,
    pub no_paper: usize,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub error_jobs: u64,
    pub agents_connected: usize,
    pub observers_connected: usize,
    pub open_circuits: usize,
    pub pending_requests: usize,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    StatusBulk(Arc<Vec<Arc<PrinterStatus>>>),
    StatusDelta(Arc<PrinterStatus>),
    JobUpdate(JobUpdate),
    TestResult(TestOutcome),
    AlertRaised(Alert),
    AlertCleared(Alert),
    Analytics(FleetSnapshot),
    AgentPresence(AgentPresence),
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusBulk(_) => "status_bulk",
            Self::StatusDelta(_) => "status_delta",
            Self::JobUpdate(_) => "job_update",
            Self::TestResult(_) => "test_result",
            Self::AlertRaised(_) => "alert",
            Self::AlertCleared(_) => "alert_cleared",
            Self::Analytics(_) => "analytics",
            Self::AgentPresence(_) => "agent_presence",
        }
    }

    /// Tenant the event belongs to. Fleet-wide events return `None`.
    pub fn company_id(&self) -> Option<&str> {
        match self {
            Self::StatusDelta(p) => Some(&p.company_id),
            Self::JobUpdate(j) => Some(&j.company_id),
            Self::TestResult(t) => Some(&t.company_id),
            Self::AlertRaised(a) | Self::AlertCleared(a) => Some(&a.company_id),
            Self::AgentPresence(p) => Some(&p.company_id),
            Self::StatusBulk(_) | Self::Analytics(_) => None,
        }
    }
}
