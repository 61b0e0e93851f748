// ── Wire ↔ domain conversions ──
//
// Bridges fleetlink-api payloads and fleetlink-core domain types. Agent
// reports are sparse: only fields present on the wire touch the domain
// value.

use chrono::{DateTime, Utc};
use fleetlink_api::ObserverEvent;
use fleetlink_api::protocol::{
    AgentPresencePayload, AlertPayload, AnalyticsPayload, JobUpdatePayload, PrinterPayload,
    PrinterReport, TestResultPayload,
};

use crate::model::{
    AgentPresence, Alert, FleetEvent, FleetSnapshot, JobUpdate, PrinterState, PrinterStatus,
    TestOutcome,
};

// ── Agent → domain ───────────────────────────────────────────────────

/// Merge an agent report into a printer. A report without a status
/// brings an offline printer back online.
pub(crate) fn apply_report(printer: &mut PrinterStatus, report: &PrinterReport, now: DateTime<Utc>) {
    if let Some(ref name) = report.name {
        printer.name = Some(name.clone());
    }
    if let Some(ref model) = report.model {
        printer.model = Some(model.clone());
    }
    match report.status {
        Some(status) => printer.status = status,
        None if printer.status == PrinterState::Offline => printer.status = PrinterState::Online,
        None => {}
    }
    if let Some(level) = report.paper_level {
        printer.paper_level = level.min(100);
    }
    if let Some(temperature) = report.temperature {
        printer.temperature = temperature;
    }
    if let Some(queue) = report.queue_length {
        printer.queue_length = queue;
    }
    if let Some(ref connection_type) = report.connection_type {
        printer.connection_type = Some(connection_type.clone());
    }
    if let Some(ref capabilities) = report.capabilities {
        printer.capabilities.clone_from(capabilities);
    }
    printer.last_seen = Some(now);
}

// ── Domain → observer wire ───────────────────────────────────────────

impl From<&PrinterStatus> for PrinterPayload {
    fn from(p: &PrinterStatus) -> Self {
        Self {
            id: p.id.clone(),
            company_id: p.company_id.clone(),
            branch_id: p.branch_id.clone(),
            name: p.name.clone(),
            model: p.model.clone(),
            status: p.status,
            paper_level: p.paper_level,
            temperature: p.temperature,
            queue_length: p.queue_length,
            total_jobs: p.total_jobs,
            completed_jobs: p.completed_jobs,
            error_jobs: p.error_jobs,
            last_seen: p.last_seen,
            connection_type: p.connection_type.clone(),
            capabilities: p.capabilities.clone(),
        }
    }
}

impl From<&Alert> for AlertPayload {
    fn from(a: &Alert) -> Self {
        Self {
            id: a.id.clone(),
            printer_id: a.printer_id.clone(),
            company_id: a.company_id.clone(),
            branch_id: a.branch_id.clone(),
            kind: a.kind.to_string(),
            severity: a.severity.to_string(),
            message: a.message.clone(),
            raised_at: a.raised_at,
        }
    }
}

impl From<&JobUpdate> for JobUpdatePayload {
    fn from(j: &JobUpdate) -> Self {
        Self {
            job_id: j.job_id.clone(),
            printer_id: j.printer_id.clone(),
            branch_id: j.branch_id.clone(),
            state: j.state,
            error: j.error.clone(),
        }
    }
}

impl From<&TestOutcome> for TestResultPayload {
    #[allow(clippy::cast_possible_truncation)]
    fn from(t: &TestOutcome) -> Self {
        Self {
            printer_id: t.printer_id.clone(),
            branch_id: t.branch_id.clone(),
            success: t.success,
            message: t.message.clone(),
            latency_ms: t.latency.as_millis() as u64,
        }
    }
}

impl From<&FleetSnapshot> for AnalyticsPayload {
    fn from(s: &FleetSnapshot) -> Self {
        Self {
            total_printers: s.total_printers,
            online: s.online,
            offline: s.offline,
            busy: s.busy,
            error: s.error,
            low_paper: s.low_paper,
            no_paper: s.no_paper,
            total_jobs: s.total_jobs,
            completed_jobs: s.completed_jobs,
            error_jobs: s.error_jobs,
            agents_connected: s.agents_connected,
            observers_connected: s.observers_connected,
            open_circuits: s.open_circuits,
            pending_requests: s.pending_requests,
            captured_at: s.captured_at,
        }
    }
}

impl From<&AgentPresence> for AgentPresencePayload {
    fn from(p: &AgentPresence) -> Self {
        Self {
            company_id: p.company_id.clone(),
            branch_id: p.branch_id.clone(),
            device_id: p.device_id.clone(),
            connected: p.connected,
            agents_in_branch: p.agents_in_branch,
        }
    }
}

impl From<&FleetEvent> for ObserverEvent {
    fn from(event: &FleetEvent) -> Self {
        match event {
            FleetEvent::StatusBulk(printers) => ObserverEvent::StatusBulk {
                printers: printers.iter().map(|p| PrinterPayload::from(&**p)).collect(),
            },
            FleetEvent::StatusDelta(p) => ObserverEvent::StatusDelta {
                printer: PrinterPayload::from(&**p),
            },
            FleetEvent::JobUpdate(j) => ObserverEvent::JobUpdate(j.into()),
            FleetEvent::TestResult(t) => ObserverEvent::TestResult(t.into()),
            FleetEvent::AlertRaised(a) => ObserverEvent::Alert(a.into()),
            FleetEvent::AlertCleared(a) => ObserverEvent::AlertCleared {
                alert_id: a.id.clone(),
                printer_id: a.printer_id.clone(),
            },
            FleetEvent::Analytics(s) => ObserverEvent::Analytics(s.into()),
            FleetEvent::AgentPresence(p) => ObserverEvent::AgentPresence(p.into()),
        }
    }
}
