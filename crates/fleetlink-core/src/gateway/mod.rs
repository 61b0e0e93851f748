//! Connection & correlation gateway.
//!
//! Owns every live agent and observer socket. Agents are grouped by
//! branch; a device command fans out to every agent of the target branch
//! and the first matching reply wins. Observers only ever receive
//! broadcasts.
//!
//! The transport ([`fleetlink_api::server`]) calls into the gateway
//! through [`ConnectionHandler`](fleetlink_api::ConnectionHandler), see
//! `dispatch.rs`. Device operations built on
//! [`send_correlated`](Gateway::send_correlated) live in `operations.rs`.

mod connection;
mod correlation;
mod dispatch;
mod operations;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetlink_api::server::ServerConfig;
use fleetlink_api::{AgentCommand, AgentMessage, ConnectionId, ObserverEvent, Outbound, Role, ToAgent};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::clock::SharedClock;
use crate::discovery::HeartbeatAggregator;
use crate::error::CoreError;
use crate::latency::LatencyTracker;
use crate::model::{FleetEvent, FleetSnapshot, PrinterState};
use crate::store::{PrinterSnapshot, PrinterStore};

use connection::{ConnectionTable, branch_of, deliver};
use correlation::{CorrelationTable, Pending, PendingGuard};

pub use connection::{ConnectionInfo, OBSERVERS_GROUP, branch_group, company_group};
pub use correlation::ReplyMatcher;
pub use operations::AgentReceipt;

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transport tuning handed to the accept loop.
    pub server: ServerConfig,
    /// How long past its deadline a request may linger before the sweep
    /// removes it.
    pub correlation_grace: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// In-process `FleetEvent` channel depth.
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            correlation_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            event_capacity: 1024,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────

pub struct Gateway {
    config: GatewayConfig,
    connections: ConnectionTable,
    pending: CorrelationTable,
    store: Arc<PrinterStore>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<LatencyTracker>,
    discovery: Arc<HeartbeatAggregator>,
    events: broadcast::Sender<FleetEvent>,
    clock: SharedClock,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<PrinterStore>,
        breaker: Arc<CircuitBreaker>,
        tracker: Arc<LatencyTracker>,
        discovery: Arc<HeartbeatAggregator>,
        clock: SharedClock,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            connections: ConnectionTable::default(),
            pending: CorrelationTable::default(),
            store,
            breaker,
            tracker,
            discovery,
            events,
            clock,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PrinterStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn tracker(&self) -> &Arc<LatencyTracker> {
        &self.tracker
    }

    /// Every event broadcast to observers, for in-process consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // ── Connections & groups ─────────────────────────────────────────

    /// Add a connection to a group. Joining twice is a no-op.
    pub fn join(&self, id: ConnectionId, group: &str) -> bool {
        let joined = self.connections.join(id, group);
        if joined {
            debug!(connection = %id, group, "joined group");
        }
        joined
    }

    pub fn leave(&self, id: ConnectionId, group: &str) -> bool {
        self.connections.leave(id, group)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.info(id)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.list()
    }

    pub fn agents_in_branch(&self, branch_id: &str) -> usize {
        self.connections.agent_count_in(&branch_group(branch_id))
    }

    pub fn agent_count(&self) -> usize {
        self.connections.count(Role::Agent)
    }

    pub fn observer_count(&self) -> usize {
        self.connections.count(Role::Observer)
    }

    /// Requests currently waiting for an agent reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ── Correlated requests ──────────────────────────────────────────

    /// Send `command` to every agent in `group` and wait for the first
    /// reply that echoes the request's correlation id or satisfies
    /// `matcher`.
    ///
    /// Fails fast with [`CoreError::NoAgentConnected`] when the group has
    /// no agent. Dropping the returned future withdraws the request and
    /// tells the agents to cancel it.
    pub async fn send_correlated(
        &self,
        group: &str,
        command: AgentCommand,
        matcher: Option<ReplyMatcher>,
        timeout: Duration,
    ) -> Result<AgentMessage, CoreError> {
        let no_agent = || CoreError::NoAgentConnected {
            branch_id: branch_of(group).to_owned(),
        };

        let targets = self.connections.agents_in(group);
        if targets.is_empty() {
            return Err(no_agent());
        }

        let operation = command_name(&command);
        let correlation_id = Uuid::new_v4();
        let frame: Arc<str> = serde_json::to_string(&ToAgent::Request {
            correlation_id,
            command,
        })
        .map_err(|e| CoreError::Internal(format!("encoding request: {e}")))?
        .into();

        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            Pending {
                group: group.to_owned(),
                operation: operation.to_owned(),
                matcher,
                targets: targets.clone(),
                deadline: Instant::now() + timeout,
                reply,
            },
        );
        let guard = PendingGuard::new(&self.pending, correlation_id);

        let delivered = targets
            .iter()
            .filter(|(id, tx)| deliver(*id, tx, Outbound::Text(Arc::clone(&frame))))
            .count();
        if delivered == 0 {
            guard.release_quietly();
            return Err(no_agent());
        }
        debug!(%correlation_id, group, operation, agents = delivered, "request sent");

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CoreError::Abandoned { correlation_id }),
            Err(_) => {
                warn!(%correlation_id, group, operation, after = ?timeout, "request timed out");
                Err(CoreError::Timeout {
                    operation: operation.to_owned(),
                    after: timeout,
                })
            }
        };
        drop(guard);
        result
    }

    /// Remove requests that outlived their deadline by more than the
    /// configured grace.
    pub fn sweep_expired(&self) -> usize {
        let swept = self
            .pending
            .sweep(Instant::now(), self.config.correlation_grace);
        if swept > 0 {
            warn!(swept, "removed expired correlation entries");
        }
        swept
    }

    // ── Observer broadcast ───────────────────────────────────────────

    /// Deliver an event to every observer allowed to see it, then to
    /// in-process subscribers. Never blocks; a slow observer loses frames.
    pub fn broadcast_status(&self, event: FleetEvent) {
        let observers = self.connections.observers();
        if !observers.is_empty() {
            match event {
                FleetEvent::StatusBulk(ref printers) => {
                    let mut by_scope: HashMap<Option<String>, Option<Arc<str>>> = HashMap::new();
                    for (id, scope, tx) in &observers {
                        let frame = by_scope
                            .entry(scope.clone())
                            .or_insert_with(|| encode(&bulk_for(printers, scope.as_deref())));
                        if let Some(frame) = frame {
                            deliver(*id, tx, Outbound::Text(Arc::clone(frame)));
                        }
                    }
                }
                _ => {
                    let company = event.company_id();
                    if let Some(frame) = encode(&ObserverEvent::from(&event)) {
                        for (id, scope, tx) in &observers {
                            if visible_to(scope.as_deref(), company) {
                                deliver(*id, tx, Outbound::Text(Arc::clone(&frame)));
                            }
                        }
                    }
                }
            }
        }
        // No in-process subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Send a whole-fleet status frame to one observer, scoped to its
    /// company.
    pub(crate) fn send_bulk_to(&self, id: ConnectionId) {
        let scope = self
            .connections
            .handshake(id)
            .and_then(|hs| hs.company_id);
        let frame = bulk_for(&self.store.snapshot(), scope.as_deref());
        self.send_frame(id, &frame);
    }

    pub(crate) fn send_frame<T: Serialize>(&self, id: ConnectionId, frame: &T) -> bool {
        let (Some(tx), Some(text)) = (self.connections.sender(id), encode(frame)) else {
            return false;
        };
        deliver(id, &tx, Outbound::Text(text))
    }

    // ── Analytics ────────────────────────────────────────────────────

    /// Point-in-time fleet counters.
    pub fn snapshot(&self) -> FleetSnapshot {
        let printers = self.store.snapshot();
        let mut snap = FleetSnapshot {
            total_printers: printers.len(),
            agents_connected: self.agent_count(),
            observers_connected: self.observer_count(),
            open_circuits: self.breaker.open_count(),
            pending_requests: self.pending.len(),
            captured_at: self.clock.now(),
            ..FleetSnapshot::default()
        };
        for printer in printers.iter() {
            match printer.status {
                PrinterState::Online => snap.online += 1,
                PrinterState::Offline => snap.offline += 1,
                PrinterState::Busy => snap.busy += 1,
                PrinterState::Error => snap.error += 1,
                PrinterState::LowPaper => snap.low_paper += 1,
                PrinterState::NoPaper => snap.no_paper += 1,
            }
            snap.total_jobs += printer.total_jobs;
            snap.completed_jobs += printer.completed_jobs;
            snap.error_jobs += printer.error_jobs;
        }
        snap
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn command_name(command: &AgentCommand) -> &'static str {
    match command {
        AgentCommand::TestPrint(_) => "test_print",
        AgentCommand::PrintJob(_) => "print_job",
        AgentCommand::RawPrint(_) => "raw_print",
        AgentCommand::Control(_) => "control",
    }
}

fn encode<T: Serialize>(frame: &T) -> Option<Arc<str>> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            warn!(error = %e, "failed to encode outbound frame");
            None
        }
    }
}

/// An observer scoped to a company sees only that company's events;
/// fleet-wide events go to everyone.
fn visible_to(scope: Option<&str>, company: Option<&str>) -> bool {
    match (scope, company) {
        (Some(scope), Some(company)) => scope == company,
        _ => true,
    }
}

fn bulk_for(printers: &PrinterSnapshot, scope: Option<&str>) -> ObserverEvent {
    let visible: Vec<_> = printers
        .iter()
        .filter(|p| scope.is_none_or(|c| p.company_id == c))
        .cloned()
        .collect();
    ObserverEvent::from(&FleetEvent::StatusBulk(Arc::new(visible)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit::CircuitConfig;
    use crate::clock::ManualClock;
    use crate::discovery::DiscoveryConfig;
    use fleetlink_api::Handshake;
    use fleetlink_api::protocol::TestPrintRequest;
    use fleetlink_api::ConnectionHandler;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    pub(crate) fn gateway() -> Gateway {
        let clock = ManualClock::starting_now();
        Gateway::new(
            GatewayConfig::default(),
            Arc::new(PrinterStore::new()),
            Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone())),
            Arc::new(LatencyTracker::default()),
            Arc::new(HeartbeatAggregator::new(DiscoveryConfig::default(), clock.clone())),
            clock,
        )
    }

    fn connect(gw: &Gateway, hs: Handshake) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(64);
        gw.on_open(id, hs, tx);
        (id, rx)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn test_print(printer: &str) -> AgentCommand {
        AgentCommand::TestPrint(TestPrintRequest {
            printer_id: printer.into(),
            ..TestPrintRequest::default()
        })
    }

    #[tokio::test]
    async fn no_agent_fails_fast() {
        let gw = gateway();
        let err = gw
            .send_correlated("branch:b1", test_print("p1"), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoAgentConnected { ref branch_id } if branch_id == "b1"));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_cancels() {
        let gw = gateway();
        let (_agent, mut rx) = connect(&gw, Handshake::agent("acme", "b1", "till"));
        frames(&mut rx);

        let err = gw
            .send_correlated("branch:b1", test_print("p1"), None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(err.to_string().contains("2.0s"));
        assert_eq!(gw.pending_count(), 0);

        let kinds: Vec<_> = frames(&mut rx).into_iter().map(|f| f["type"].clone()).collect();
        assert_eq!(kinds, ["request", "cancel"]);
    }

    #[tokio::test]
    async fn observers_get_scoped_status() {
        let gw = gateway();
        gw.store().upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online);
        gw.store().upsert_with("p2", "globex", "b9", |p| p.status = PrinterState::Online);

        let (_all, mut all_rx) = connect(&gw, Handshake::observer(None));
        let (_acme, mut acme_rx) = connect(&gw, Handshake::observer(Some("acme".into())));

        let all = frames(&mut all_rx);
        assert_eq!(all[0]["type"], "welcome");
        assert_eq!(all[1]["printers"].as_array().unwrap().len(), 2);
        let acme = frames(&mut acme_rx);
        assert_eq!(acme[1]["printers"].as_array().unwrap().len(), 1);

        let delta = gw.store().update("p2", |p| p.paper_level = 50).unwrap();
        gw.broadcast_status(FleetEvent::StatusDelta(delta));
        assert_eq!(frames(&mut all_rx).len(), 1);
        assert!(frames(&mut acme_rx).is_empty());
    }

    #[test]
    fn snapshot_counts_by_status() {
        let gw = gateway();
        gw.store().upsert_with("p1", "acme", "b1", |p| {
            p.status = PrinterState::Online;
            p.total_jobs = 4;
            p.error_jobs = 1;
        });
        gw.store().upsert_with("p2", "acme", "b1", |p| p.status = PrinterState::NoPaper);
        let _ = connect(&gw, Handshake::agent("acme", "b1", "till"));

        let snap = gw.snapshot();
        assert_eq!(snap.total_printers, 2);
        assert_eq!(snap.online, 1);
        assert_eq!(snap.no_paper, 1);
        assert_eq!(snap.total_jobs, 4);
        assert_eq!(snap.error_jobs, 1);
        assert_eq!(snap.agents_connected, 1);
    }

    #[test]
    fn visibility_rules() {
        assert!(visible_to(None, Some("acme")));
        assert!(visible_to(Some("acme"), None));
        assert!(visible_to(Some("acme"), Some("acme")));
        assert!(!visible_to(Some("acme"), Some("globex")));
    }
}
