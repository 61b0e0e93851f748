// ── Correlation table ──
//
// Outstanding requests keyed by correlation id. An entry lives exactly
// as long as someone waits for it: the reply path, the disconnect path
// and the sweep remove it by taking it out of the map, and the waiting
// side holds a `PendingGuard` that removes it on every other exit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fleetlink_api::{AgentMessage, ConnectionId, Outbound, ToAgent};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::CoreError;

/// Accepts replies that carry no correlation id.
pub type ReplyMatcher = Arc<dyn Fn(&AgentMessage) -> bool + Send + Sync>;

pub(crate) type ReplySender = oneshot::Sender<Result<AgentMessage, CoreError>>;

pub(crate) struct Pending {
    pub group: String,
    pub operation: String,
    pub matcher: Option<ReplyMatcher>,
    pub targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)>,
    pub deadline: Instant,
    pub reply: ReplySender,
}

#[derive(Default)]
pub(crate) struct CorrelationTable {
    pending: DashMap<Uuid, Pending>,
}

impl CorrelationTable {
    pub fn insert(&self, id: Uuid, pending: Pending) {
        self.pending.insert(id, pending);
    }

    pub fn remove(&self, id: Uuid) -> Option<Pending> {
        self.pending.remove(&id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.pending.contains_key(&id)
    }

    /// Hand a reply from a member of `sender_group` to its waiter.
    ///
    /// A reply carrying a correlation id resolves only that request, and
    /// only when it comes from the group the request was sent to; a late
    /// duplicate of an already-answered request resolves nothing. Replies
    /// without one go to the first request of the same group whose
    /// matcher accepts them.
    pub fn resolve(&self, sender_group: Option<&str>, message: &AgentMessage) -> Option<Uuid> {
        let group = sender_group?;
        let id = match message.correlation_id() {
            Some(id) => id,
            None => self.pending.iter().find_map(|entry| {
                let pending = entry.value();
                let accepts =
                    pending.group == group && pending.matcher.as_ref().is_some_and(|m| m(message));
                accepts.then(|| *entry.key())
            })?,
        };

        let (_, pending) = self.pending.remove_if(&id, |_, p| p.group == group)?;
        trace!(correlation_id = %id, kind = message.kind(), "reply matched");
        // The waiter may have been dropped in between; nothing to do then.
        let _ = pending.reply.send(Ok(message.clone()));
        Some(id)
    }

    /// Fail every request waiting on `group`.
    pub fn fail_group(&self, group: &str, error: impl Fn() -> CoreError) -> usize {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|p| p.group == group)
            .map(|p| *p.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some(pending) = self.remove(id) {
                let _ = pending.reply.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }

    /// Drop entries whose deadline passed more than `grace` ago. Their
    /// waiters time out on their own; this only catches leaks.
    pub fn sweep(&self, now: Instant, grace: Duration) -> usize {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|p| p.deadline + grace <= now)
            .map(|p| *p.key())
            .collect();

        let mut swept = 0;
        for id in expired {
            if let Some(pending) = self.remove(id) {
                debug!(correlation_id = %id, operation = %pending.operation, "sweeping expired request");
                let _ = pending.reply.send(Err(CoreError::Abandoned { correlation_id: id }));
                swept += 1;
            }
        }
        swept
    }
}

// ── PendingGuard ─────────────────────────────────────────────────────

/// Removes a request from the table when its waiter goes away.
///
/// If the entry is still present on drop (timeout, cancellation, early
/// return) the agents that received the request get a best-effort
/// `cancel` frame.
pub(crate) struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: Uuid,
    notify: bool,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a CorrelationTable, id: Uuid) -> Self {
        Self {
            table,
            id,
            notify: true,
        }
    }

    /// Remove the entry without telling agents anything.
    pub fn release_quietly(mut self) {
        self.notify = false;
        self.table.remove(self.id);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(pending) = self.table.remove(self.id) else {
            return;
        };
        if !self.notify {
            return;
        }
        debug!(correlation_id = %self.id, operation = %pending.operation, "request abandoned, cancelling");
        let Ok(text) = serde_json::to_string(&ToAgent::Cancel {
            correlation_id: self.id,
        }) else {
            return;
        };
        let text: Arc<str> = text.into();
        for (_, outbound) in &pending.targets {
            let _ = outbound.try_send(Outbound::Text(Arc::clone(&text)));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleetlink_api::CommandReply;

    fn pending(
        group: &str,
        matcher: Option<ReplyMatcher>,
    ) -> (Pending, oneshot::Receiver<Result<AgentMessage, CoreError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Pending {
                group: group.into(),
                operation: "test_print".into(),
                matcher,
                targets: Vec::new(),
                deadline: Instant::now(),
                reply,
            },
            rx,
        )
    }

    fn test_result(correlation_id: Option<Uuid>, printer: &str) -> AgentMessage {
        AgentMessage::TestResult(CommandReply {
            correlation_id,
            printer_id: Some(printer.into()),
            success: true,
            message: None,
        })
    }

    fn for_printer(printer: &'static str) -> ReplyMatcher {
        Arc::new(move |m: &AgentMessage| m.printer_id() == Some(printer))
    }

    #[tokio::test]
    async fn correlation_id_match_removes_entry() {
        let table = CorrelationTable::default();
        let id = Uuid::new_v4();
        let (p, rx) = pending("branch:b1", None);
        table.insert(id, p);

        assert_eq!(table.resolve(Some("branch:b1"), &test_result(Some(id), "p1")), Some(id));
        assert_eq!(table.len(), 0);
        assert!(rx.await.unwrap().is_ok());

        // A duplicate from a second agent resolves nothing.
        assert_eq!(table.resolve(Some("branch:b1"), &test_result(Some(id), "p1")), None);
    }

    #[test]
    fn correlation_id_from_another_branch_is_ignored() {
        let table = CorrelationTable::default();
        let id = Uuid::new_v4();
        let (p, _rx) = pending("branch:b1", None);
        table.insert(id, p);

        assert_eq!(table.resolve(Some("branch:b2"), &test_result(Some(id), "p1")), None);
        assert_eq!(table.resolve(None, &test_result(Some(id), "p1")), None);
        assert!(table.contains(id));
        assert_eq!(table.resolve(Some("branch:b1"), &test_result(Some(id), "p1")), Some(id));
    }

    #[test]
    fn matcher_only_applies_within_sender_group() {
        let table = CorrelationTable::default();
        let id = Uuid::new_v4();
        let (p, _rx) = pending("branch:b1", Some(for_printer("p1")));
        table.insert(id, p);

        assert_eq!(table.resolve(Some("branch:b2"), &test_result(None, "p1")), None);
        assert_eq!(table.resolve(Some("branch:b1"), &test_result(None, "p2")), None);
        assert_eq!(table.resolve(Some("branch:b1"), &test_result(None, "p1")), Some(id));
    }

    #[test]
    fn unknown_correlation_id_does_not_fall_back_to_matcher() {
        let table = CorrelationTable::default();
        let (p, _rx) = pending("branch:b1", Some(for_printer("p1")));
        table.insert(Uuid::new_v4(), p);

        let stale = test_result(Some(Uuid::new_v4()), "p1");
        assert_eq!(table.resolve(Some("branch:b1"), &stale), None);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_group_only_touches_that_group() {
        let table = CorrelationTable::default();
        let (a, rx_a) = pending("branch:b1", None);
        let (b, _rx_b) = pending("branch:b2", None);
        table.insert(Uuid::new_v4(), a);
        table.insert(Uuid::new_v4(), b);

        let failed = table.fail_group("branch:b1", || CoreError::NoAgentConnected {
            branch_id: "b1".into(),
        });
        assert_eq!(failed, 1);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(CoreError::NoAgentConnected { .. })
        ));
    }

    #[tokio::test]
    async fn guard_cancels_agents_on_drop() {
        let table = CorrelationTable::default();
        let id = Uuid::new_v4();
        let (tx, mut agent_rx) = mpsc::channel(4);
        let (mut p, _rx) = pending("branch:b1", None);
        p.targets.push((ConnectionId::new(), tx));
        table.insert(id, p);

        drop(PendingGuard::new(&table, id));

        assert_eq!(table.len(), 0);
        let Some(Outbound::Text(text)) = agent_rx.recv().await else {
            panic!("expected cancel frame");
        };
        let frame: ToAgent = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, ToAgent::Cancel { correlation_id: id });
    }

    #[test]
    fn quiet_release_sends_nothing() {
        let table = CorrelationTable::default();
        let id = Uuid::new_v4();
        let (tx, mut agent_rx) = mpsc::channel(4);
        let (mut p, _rx) = pending("branch:b1", None);
        p.targets.push((ConnectionId::new(), tx));
        table.insert(id, p);

        PendingGuard::new(&table, id).release_quietly();
        assert!(!table.contains(id));
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_overdue_entries() {
        let table = CorrelationTable::default();
        let (p, _rx) = pending("branch:b1", None);
        table.insert(Uuid::new_v4(), p);

        let grace = Duration::from_secs(5);
        assert_eq!(table.sweep(Instant::now(), grace), 0);
        tokio::time::advance(grace).await;
        assert_eq!(table.sweep(Instant::now(), grace), 1);
        assert_eq!(table.len(), 0);
    }
}
