// ── Transport callbacks ──
//
// The accept loop calls these from each connection's reader task, so
// frames from one socket are handled strictly in arrival order. Nothing
// here awaits.

use fleetlink_api::protocol::{HeartbeatReport, JobReport, PrinterReport};
use fleetlink_api::{
    AgentMessage, ConnectionHandler, ConnectionId, Handshake, ObserverEvent, ObserverMessage,
    Outbound, Role, ToAgent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Gateway, OBSERVERS_GROUP, branch_group, company_group};
use crate::convert::apply_report;
use crate::error::CoreError;
use crate::model::{AgentPresence, FleetEvent, JobState, JobUpdate, PrinterState};

impl ConnectionHandler for Gateway {
    fn on_open(&self, id: ConnectionId, handshake: Handshake, outbound: mpsc::Sender<Outbound>) {
        let role = handshake.role;
        let company = handshake.company_id.clone();
        let branch = handshake.branch_id.clone();
        let device = handshake.device_id.clone();
        self.connections
            .insert(id, handshake, outbound, self.clock.now());

        match role {
            Role::Agent => {
                if let Some(ref branch) = branch {
                    self.join(id, &branch_group(branch));
                }
                if let Some(ref company) = company {
                    self.join(id, &company_group(company));
                }
                self.send_frame(id, &ToAgent::Welcome { connection_id: id });
                info!(
                    connection = %id,
                    company = company.as_deref().unwrap_or_default(),
                    branch = branch.as_deref().unwrap_or_default(),
                    device = device.as_deref().unwrap_or_default(),
                    "agent connected"
                );
                if let (Some(company_id), Some(branch_id)) = (company, branch) {
                    self.announce_presence(company_id, branch_id, device, true);
                }
            }
            Role::Observer => {
                self.join(id, OBSERVERS_GROUP);
                if let Some(ref company) = company {
                    self.join(id, &company_group(company));
                }
                self.send_frame(id, &ObserverEvent::Welcome { connection_id: id });
                self.send_bulk_to(id);
                info!(connection = %id, company = company.as_deref().unwrap_or("*"), "observer connected");
            }
        }
    }

    fn on_frame(&self, id: ConnectionId, text: &str) {
        let Some(handshake) = self.connections.handshake(id) else {
            return;
        };

        match handshake.role {
            Role::Agent => match serde_json::from_str::<AgentMessage>(text) {
                Ok(message) => self.handle_agent_message(id, &handshake, &message),
                Err(e) => warn!(connection = %id, error = %e, "dropping undecodable agent frame"),
            },
            Role::Observer => match serde_json::from_str::<ObserverMessage>(text) {
                Ok(ObserverMessage::RequestSnapshot) => self.send_bulk_to(id),
                Ok(ObserverMessage::Ping) => {
                    self.send_frame(id, &ObserverEvent::Pong);
                }
                Err(e) => debug!(connection = %id, error = %e, "ignoring observer frame"),
            },
        }
    }

    fn on_close(&self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(id) else {
            return;
        };
        let hs = conn.handshake;

        if hs.role == Role::Observer {
            debug!(connection = %id, "observer disconnected");
            return;
        }

        let (Some(company_id), Some(branch_id)) = (hs.company_id, hs.branch_id) else {
            return;
        };
        let group = branch_group(&branch_id);
        let remaining = self.connections.agent_count_in(&group);
        info!(connection = %id, company = %company_id, branch = %branch_id, remaining, "agent disconnected");

        if remaining == 0 {
            let failed = self.pending.fail_group(&group, || CoreError::NoAgentConnected {
                branch_id: branch_id.clone(),
            });
            let offline = self.store.mark_branch_offline(&company_id, &branch_id);
            warn!(
                branch = %branch_id,
                failed_requests = failed,
                printers_offline = offline.len(),
                "last agent of branch gone"
            );
            for printer in offline {
                self.broadcast_status(FleetEvent::StatusDelta(printer));
            }
        }

        self.announce_presence(company_id, branch_id, hs.device_id, false);
    }
}

impl Gateway {
    fn handle_agent_message(&self, id: ConnectionId, hs: &Handshake, message: &AgentMessage) {
        let company = hs.company_id.as_deref().unwrap_or_default();
        let branch = hs.branch_id.as_deref().unwrap_or_default();
        debug!(connection = %id, kind = message.kind(), "agent frame");

        match message {
            AgentMessage::PrinterDiscovered(report) | AgentMessage::PrinterStatus(report) => {
                self.apply_printer_report(company, branch, report);
            }
            AgentMessage::JobStarted(job) => {
                self.apply_job(company, branch, job, JobState::Started);
            }
            AgentMessage::JobCompleted(job) => {
                self.apply_job(company, branch, job, JobState::Completed);
            }
            AgentMessage::JobFailed(job) => {
                self.apply_job(company, branch, job, JobState::Failed);
            }
            AgentMessage::DiscoveryHeartbeat(report) => self.ingest_heartbeat(hs, report),
            AgentMessage::TestResult(_)
            | AgentMessage::RawPrintResult(_)
            | AgentMessage::ControlAck(_) => {}
        }

        if is_reply(message) {
            let sender_group = hs.branch_id.as_deref().map(branch_group);
            if self.pending.resolve(sender_group.as_deref(), message).is_none() {
                debug!(
                    connection = %id,
                    kind = message.kind(),
                    correlation_id = ?message.correlation_id(),
                    "reply matched no pending request"
                );
            }
        }
    }

    fn apply_printer_report(&self, company: &str, branch: &str, report: &PrinterReport) {
        if report.printer_id.trim().is_empty() {
            warn!(branch, "printer report without printer id");
            return;
        }
        let now = self.clock.now();
        let updated = self
            .store
            .upsert_with(&report.printer_id, company, branch, |p| apply_report(p, report, now));
        if let Some(printer) = updated {
            self.broadcast_status(FleetEvent::StatusDelta(printer));
        }
    }

    fn apply_job(&self, company: &str, branch: &str, job: &JobReport, state: JobState) {
        let now = self.clock.now();
        let updated = self.store.upsert_with(&job.printer_id, company, branch, |p| {
            p.last_seen = Some(now);
            match state {
                JobState::Started => p.status = PrinterState::Busy,
                JobState::Completed | JobState::Failed => {
                    p.total_jobs += 1;
                    if state == JobState::Completed {
                        p.completed_jobs += 1;
                    } else {
                        p.error_jobs += 1;
                    }
                    p.queue_length = p.queue_length.saturating_sub(1);
                    if p.status == PrinterState::Busy {
                        p.status = PrinterState::Online;
                    }
                }
                JobState::Queued => {}
            }
        });
        if let Some(printer) = updated {
            self.broadcast_status(FleetEvent::StatusDelta(printer));
        }

        self.broadcast_status(FleetEvent::JobUpdate(JobUpdate {
            job_id: job.job_id.clone(),
            printer_id: job.printer_id.clone(),
            company_id: company.to_owned(),
            branch_id: branch.to_owned(),
            state,
            error: job.error.clone(),
        }));
    }

    /// Heartbeats default their tenant scope to the sender's handshake.
    fn ingest_heartbeat(&self, hs: &Handshake, report: &HeartbeatReport) {
        let mut report = report.clone();
        report.company_id = report.company_id.or_else(|| hs.company_id.clone());
        report.branch_id = report.branch_id.or_else(|| hs.branch_id.clone());
        report.device_id = report.device_id.or_else(|| hs.device_id.clone());
        if let Err(e) = self.discovery.ingest(&report) {
            warn!(error = %e, "rejected discovery heartbeat");
        }
    }

    fn announce_presence(
        &self,
        company_id: String,
        branch_id: String,
        device_id: Option<String>,
        connected: bool,
    ) {
        let agents_in_branch = self.agents_in_branch(&branch_id);
        self.broadcast_status(FleetEvent::AgentPresence(AgentPresence {
            company_id,
            branch_id,
            device_id,
            connected,
            agents_in_branch,
        }));
    }
}

/// Messages that may answer a pending request. `job_started` is
/// progress, not an answer.
fn is_reply(message: &AgentMessage) -> bool {
    matches!(
        message,
        AgentMessage::JobCompleted(_)
            | AgentMessage::JobFailed(_)
            | AgentMessage::TestResult(_)
            | AgentMessage::RawPrintResult(_)
            | AgentMessage::ControlAck(_)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleetlink_api::protocol::{AgentCommand, CommandReply, TestPrintRequest};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::gateway::tests::gateway;

    fn open(gw: &Gateway, hs: Handshake) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(64);
        gw.on_open(id, hs, tx);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn status_report_upserts_and_broadcasts_delta() {
        let gw = gateway();
        let (agent, _agent_rx) = open(&gw, Handshake::agent("acme", "b1", "till"));
        let (_obs, mut obs_rx) = open(&gw, Handshake::observer(None));
        drain(&mut obs_rx);

        let frame = json!({
            "type": "printer_status",
            "printerId": "kitchen-1",
            "paperLevel": 42,
            "status": "online"
        });
        gw.on_frame(agent, &frame.to_string());

        let printer = gw.store().get("kitchen-1").unwrap();
        assert_eq!(printer.company_id, "acme");
        assert_eq!(printer.paper_level, 42);

        let frames = drain(&mut obs_rx);
        assert_eq!(frames[0]["type"], "status_delta");
        assert_eq!(frames[0]["printer"]["id"], "kitchen-1");
    }

    #[test]
    fn job_lifecycle_updates_counters() {
        let gw = gateway();
        let (agent, _rx) = open(&gw, Handshake::agent("acme", "b1", "till"));
        let mut events = gw.subscribe();

        for kind in ["job_started", "job_completed"] {
            let frame = json!({ "type": kind, "jobId": "j1", "printerId": "p1" });
            gw.on_frame(agent, &frame.to_string());
        }

        let printer = gw.store().get("p1").unwrap();
        assert_eq!(printer.total_jobs, 1);
        assert_eq!(printer.completed_jobs, 1);
        assert_eq!(printer.status, PrinterState::Online);

        let mut job_states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::JobUpdate(update) = event {
                job_states.push(update.state);
            }
        }
        assert_eq!(job_states, [JobState::Started, JobState::Completed]);
    }

    #[test]
    fn heartbeat_takes_scope_from_handshake() {
        let gw = gateway();
        let (agent, _rx) = open(&gw, Handshake::agent("acme", "b1", "till"));
        let frame = json!({ "type": "discovery_heartbeat", "appVersion": "2.1.0", "cachedPrinters": 3 });
        gw.on_frame(agent, &frame.to_string());

        let status = gw.discovery.branch_status("b1", "acme").unwrap();
        assert!(status.alive);
        assert_eq!(status.latest.device_id.as_deref(), Some("till"));
    }

    #[test]
    fn observer_ping_gets_pong() {
        let gw = gateway();
        let (obs, mut rx) = open(&gw, Handshake::observer(None));
        drain(&mut rx);
        gw.on_frame(obs, r#"{"type":"ping"}"#);
        assert_eq!(drain(&mut rx)[0]["type"], "pong");
    }

    #[test]
    fn observer_cannot_send_agent_frames() {
        let gw = gateway();
        let (obs, _rx) = open(&gw, Handshake::observer(None));
        gw.on_frame(obs, &json!({ "type": "printer_status", "printerId": "p1" }).to_string());
        assert!(gw.store().is_empty());
    }

    #[tokio::test]
    async fn last_agent_leaving_fails_pending_and_marks_offline() {
        let gw = Arc::new(gateway());
        let (agent, _rx) = open(&gw, Handshake::agent("acme", "b1", "till"));
        gw.on_frame(
            agent,
            &json!({ "type": "printer_status", "printerId": "p1", "status": "online" }).to_string(),
        );

        let waiter = {
            let gw = Arc::clone(&gw);
            tokio::spawn(async move {
                let command = AgentCommand::TestPrint(TestPrintRequest {
                    printer_id: "p1".into(),
                    ..TestPrintRequest::default()
                });
                gw.send_correlated("branch:b1", command, None, Duration::from_secs(30))
                    .await
            })
        };
        while gw.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        gw.on_close(agent);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::NoAgentConnected { .. }));
        assert_eq!(gw.pending_count(), 0);
        assert_eq!(gw.store().get("p1").unwrap().status, PrinterState::Offline);
        assert_eq!(gw.agents_in_branch("b1"), 0);
    }

    #[tokio::test]
    async fn reply_resolves_by_correlation_id() {
        let gw = Arc::new(gateway());
        let (agent, mut rx) = open(&gw, Handshake::agent("acme", "b1", "till"));
        drain(&mut rx);

        let waiter = {
            let gw = Arc::clone(&gw);
            tokio::spawn(async move {
                let command = AgentCommand::TestPrint(TestPrintRequest {
                    printer_id: "p1".into(),
                    ..TestPrintRequest::default()
                });
                gw.send_correlated("branch:b1", command, None, Duration::from_secs(30))
                    .await
            })
        };

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected request frame");
        };
        let ToAgent::Request { correlation_id, .. } = serde_json::from_str(&text).unwrap() else {
            panic!("expected request");
        };
        let reply = AgentMessage::TestResult(CommandReply {
            correlation_id: Some(correlation_id),
            printer_id: Some("p1".into()),
            success: true,
            message: Some("printed".into()),
        });
        gw.on_frame(agent, &serde_json::to_string(&reply).unwrap());

        assert_eq!(waiter.await.unwrap().unwrap(), reply);
        assert_eq!(gw.pending_count(), 0);
    }
}
