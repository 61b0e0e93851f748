//! Wire protocol spoken over gateway WebSockets.
//!
//! Every frame is a JSON object tagged by `type`. Each direction has its
//! own closed enum, so a frame that does not belong to the sender's role
//! fails to decode at the transport boundary instead of leaking into the
//! gateway as loosely-typed data.
//!
//! | direction           | enum               |
//! |---------------------|--------------------|
//! | agent → gateway     | [`AgentMessage`]   |
//! | gateway → agent     | [`ToAgent`]        |
//! | observer → gateway  | [`ObserverMessage`]|
//! | gateway → observer  | [`ObserverEvent`]  |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::handshake::ConnectionId;

// ── Shared enums ─────────────────────────────────────────────────────

/// Lifecycle state of a physical printer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrinterState {
    Online,
    #[default]
    Offline,
    Busy,
    Error,
    LowPaper,
    NoPaper,
}

/// Progress of a print job as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Started,
    Completed,
    Failed,
}

// ── Agent → gateway ──────────────────────────────────────────────────

/// Telemetry and replies sent by desktop agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// A printer was found by the agent's discovery loop.
    PrinterDiscovered(PrinterReport),
    /// Periodic or change-driven printer status.
    PrinterStatus(PrinterReport),
    JobStarted(JobReport),
    JobCompleted(JobReport),
    JobFailed(JobReport),
    /// Reply to a [`AgentCommand::TestPrint`].
    TestResult(CommandReply),
    /// Reply to a [`AgentCommand::RawPrint`].
    RawPrintResult(CommandReply),
    /// Reply to a [`AgentCommand::Control`].
    ControlAck(CommandReply),
    /// Liveness report from the agent's discovery service.
    DiscoveryHeartbeat(HeartbeatReport),
}

impl AgentMessage {
    /// Wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrinterDiscovered(_) => "printer_discovered",
            Self::PrinterStatus(_) => "printer_status",
            Self::JobStarted(_) => "job_started",
            Self::JobCompleted(_) => "job_completed",
            Self::JobFailed(_) => "job_failed",
            Self::TestResult(_) => "test_result",
            Self::RawPrintResult(_) => "raw_print_result",
            Self::ControlAck(_) => "control_ack",
            Self::DiscoveryHeartbeat(_) => "discovery_heartbeat",
        }
    }

    /// Correlation id echoed back by the agent, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::JobStarted(r) | Self::JobCompleted(r) | Self::JobFailed(r) => r.correlation_id,
            Self::TestResult(r) | Self::RawPrintResult(r) | Self::ControlAck(r) => {
                r.correlation_id
            }
            Self::PrinterDiscovered(_) | Self::PrinterStatus(_) | Self::DiscoveryHeartbeat(_) => {
                None
            }
        }
    }

    /// Printer this message concerns, if any.
    pub fn printer_id(&self) -> Option<&str> {
        match self {
            Self::PrinterDiscovered(p) | Self::PrinterStatus(p) => Some(&p.printer_id),
            Self::JobStarted(j) | Self::JobCompleted(j) | Self::JobFailed(j) => {
                Some(&j.printer_id)
            }
            Self::TestResult(r) | Self::RawPrintResult(r) | Self::ControlAck(r) => {
                r.printer_id.as_deref()
            }
            Self::DiscoveryHeartbeat(_) => None,
        }
    }

    /// Job this message concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobStarted(j) | Self::JobCompleted(j) | Self::JobFailed(j) => Some(&j.job_id),
            _ => None,
        }
    }
}

/// Printer snapshot as reported by an agent. Only `printer_id` is
/// mandatory; absent fields leave the gateway's view unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterReport {
    pub printer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PrinterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// Job lifecycle notification from an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub printer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Generic success/failure reply to a gateway command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Discovery-service heartbeat. Tenant scope defaults to the sending
/// connection's handshake when omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub discovery_running: bool,
    #[serde(default)]
    pub cached_printers: u32,
    #[serde(default)]
    pub total_cycles: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemReport>,
}

/// Host snapshot attached to discovery heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
}

// ── Gateway → agent ──────────────────────────────────────────────────

/// Frames the gateway sends to agent connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToAgent {
    /// Sent once after the upgrade completes.
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// A command the agent must answer, echoing `correlation_id`.
    Request {
        #[serde(rename = "correlationId")]
        correlation_id: Uuid,
        command: AgentCommand,
    },
    /// The requester gave up; the agent may drop the work.
    Cancel {
        #[serde(rename = "correlationId")]
        correlation_id: Uuid,
    },
}

/// Device commands carried inside [`ToAgent::Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    TestPrint(TestPrintRequest),
    PrintJob(PrintJobRequest),
    RawPrint(RawPrintRequest),
    Control(ControlRequest),
}

impl AgentCommand {
    /// Printer this command targets, if any.
    pub fn printer_id(&self) -> Option<&str> {
        match self {
            Self::TestPrint(r) => Some(&r.printer_id),
            Self::PrintJob(r) => Some(&r.printer_id),
            Self::RawPrint(r) => Some(&r.printer_id),
            Self::Control(r) => r.printer_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPrintRequest {
    pub printer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub cut: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJobRequest {
    pub job_id: String,
    pub printer_id: String,
    /// Rendered document, produced by the template collaborator.
    pub content: String,
    #[serde(default = "default_copies")]
    pub copies: u32,
}

fn default_copies() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrintRequest {
    pub printer_id: String,
    /// Base64 ESC/POS (or similar) payload passed through untouched.
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
}

// ── Observer → gateway ───────────────────────────────────────────────

/// Requests dashboards may send. Observers never command devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// Ask for an immediate `status_bulk` frame.
    RequestSnapshot,
    Ping,
}

// ── Gateway → observer ───────────────────────────────────────────────

/// Broadcasts delivered to dashboard connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    StatusBulk {
        printers: Vec<PrinterPayload>,
    },
    StatusDelta {
        printer: PrinterPayload,
    },
    JobUpdate(JobUpdatePayload),
    TestResult(TestResultPayload),
    Alert(AlertPayload),
    AlertCleared {
        #[serde(rename = "alertId")]
        alert_id: String,
        #[serde(rename = "printerId")]
        printer_id: String,
    },
    Analytics(AnalyticsPayload),
    AgentPresence(AgentPresencePayload),
    Pong,
}

impl ObserverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::StatusBulk { .. } => "status_bulk",
            Self::StatusDelta { .. } => "status_delta",
            Self::JobUpdate(_) => "job_update",
            Self::TestResult(_) => "test_result",
            Self::Alert(_) => "alert",
            Self::AlertCleared { .. } => "alert_cleared",
            Self::Analytics(_) => "analytics",
            Self::AgentPresence(_) => "agent_presence",
            Self::Pong => "pong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterPayload {
    pub id: String,
    pub company_id: String,
    pub branch_id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub status: PrinterState,
    pub paper_level: u8,
    pub temperature: f32,
    pub queue_length: u32,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub error_jobs: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_type: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdatePayload {
    pub job_id: String,
    pub printer_id: String,
    pub branch_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    pub printer_id: String,
    pub branch_id: String,
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub id: String,
    pub printer_id: String,
    pub company_id: String,
    pub branch_id: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPayload {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresencePayload {
    pub company_id: String,
    pub branch_id: String,
    pub device_id: Option<String>,
    pub connected: bool,
    pub agents_in_branch: usize,
}

// ── Tests ────────────────────────────────────────────────────────────
