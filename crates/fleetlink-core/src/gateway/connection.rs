// ── Connection and group table ──
//
// Every live socket and the groups it belongs to. Group membership is
// kept in both directions (connection → groups, group → connections) so
// leaving on disconnect and fan-out lookups are both per-key operations.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetlink_api::{ConnectionId, Handshake, Outbound, Role};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Group every observer joins.
pub const OBSERVERS_GROUP: &str = "observers";

const BRANCH_PREFIX: &str = "branch:";
const COMPANY_PREFIX: &str = "company:";

/// Group holding every agent connection of a branch.
pub fn branch_group(branch_id: &str) -> String {
    format!("{BRANCH_PREFIX}{branch_id}")
}

pub fn company_group(company_id: &str) -> String {
    format!("{COMPANY_PREFIX}{company_id}")
}

/// Branch id named by a branch group, or the group itself otherwise.
pub(crate) fn branch_of(group: &str) -> &str {
    group.strip_prefix(BRANCH_PREFIX).unwrap_or(group)
}

/// Public view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Role,
    pub company_id: Option<String>,
    pub branch_id: Option<String>,
    pub device_id: Option<String>,
    pub groups: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

pub(crate) struct Connection {
    pub handshake: Handshake,
    pub groups: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    pub outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    fn info(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            role: self.handshake.role,
            company_id: self.handshake.company_id.clone(),
            branch_id: self.handshake.branch_id.clone(),
            device_id: self.handshake.device_id.clone(),
            groups: self.groups.iter().cloned().collect(),
            connected_at: self.connected_at,
        }
    }
}

/// Queue a frame without waiting. A full queue drops the frame.
pub(crate) fn deliver(id: ConnectionId, outbound: &mpsc::Sender<Outbound>, frame: Outbound) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(connection = %id, "outbound queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[derive(Default)]
pub(crate) struct ConnectionTable {
    connections: DashMap<ConnectionId, Connection>,
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionTable {
    pub fn insert(
        &self,
        id: ConnectionId,
        handshake: Handshake,
        outbound: mpsc::Sender<Outbound>,
        connected_at: DateTime<Utc>,
    ) {
        self.connections.insert(
            id,
            Connection {
                handshake,
                groups: BTreeSet::new(),
                connected_at,
                outbound,
            },
        );
    }

    /// Add a connection to a group. Idempotent; returns `true` only when
    /// the membership is new.
    pub fn join(&self, id: ConnectionId, group: &str) -> bool {
        let Some(mut conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if !conn.groups.insert(group.to_owned()) {
            return false;
        }
        drop(conn);
        self.groups.entry(group.to_owned()).or_default().insert(id);
        true
    }

    pub fn leave(&self, id: ConnectionId, group: &str) -> bool {
        let removed = self
            .connections
            .get_mut(&id)
            .is_some_and(|mut conn| conn.groups.remove(group));
        if removed {
            self.drop_member(group, id);
        }
        removed
    }

    /// Forget a connection and leave every group it joined.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let (_, conn) = self.connections.remove(&id)?;
        for group in &conn.groups {
            self.drop_member(group, id);
        }
        Some(conn)
    }

    fn drop_member(&self, group: &str, id: ConnectionId) {
        self.groups.remove_if_mut(group, |_, members| {
            members.remove(&id);
            members.is_empty()
        });
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|c| c.info(id))
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> =
            self.connections.iter().map(|c| c.info(*c.key())).collect();
        all.sort_by(|a, b| (a.connected_at, a.id).cmp(&(b.connected_at, b.id)));
        all
    }

    pub fn handshake(&self, id: ConnectionId) -> Option<Handshake> {
        self.connections.get(&id).map(|c| c.handshake.clone())
    }

    pub fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.connections.get(&id).map(|c| c.outbound.clone())
    }

    /// Outbound queues of the agent members of `group`.
    pub fn agents_in(&self, group: &str) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        let Some(members) = self.groups.get(group).map(|m| m.clone()) else {
            return Vec::new();
        };
        members
            .into_iter()
            .filter_map(|id| {
                let conn = self.connections.get(&id)?;
                (conn.handshake.role == Role::Agent).then(|| (id, conn.outbound.clone()))
            })
            .collect()
    }

    pub fn agent_count_in(&self, group: &str) -> usize {
        self.agents_in(group).len()
    }

    /// Observer queues with their company scope (`None` sees everything).
    pub fn observers(&self) -> Vec<(ConnectionId, Option<String>, mpsc::Sender<Outbound>)> {
        self.connections
            .iter()
            .filter(|c| c.handshake.role == Role::Observer)
            .map(|c| (*c.key(), c.handshake.company_id.clone(), c.outbound.clone()))
            .collect()
    }

    pub fn count(&self, role: Role) -> usize {
        self.connections
            .iter()
            .filter(|c| c.handshake.role == role)
            .count()
    }

    pub fn is_member(&self, id: ConnectionId, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(&id))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table_with_agent() -> (ConnectionTable, ConnectionId, mpsc::Receiver<Outbound>) {
        let table = ConnectionTable::default();
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(4);
        table.insert(id, Handshake::agent("acme", "b1", "till-1"), tx, Utc::now());
        (table, id, rx)
    }

    #[test]
    fn join_is_idempotent() {
        let (table, id, _rx) = table_with_agent();
        assert!(table.join(id, "branch:b1"));
        assert!(!table.join(id, "branch:b1"));
        assert_eq!(table.agent_count_in("branch:b1"), 1);
        assert_eq!(table.info(id).unwrap().groups, ["branch:b1"]);
    }

    #[test]
    fn remove_leaves_every_group() {
        let (table, id, _rx) = table_with_agent();
        table.join(id, "branch:b1");
        table.join(id, "company:acme");

        assert!(table.remove(id).is_some());
        assert_eq!(table.agent_count_in("branch:b1"), 0);
        assert!(!table.is_member(id, "company:acme"));
        assert_eq!(table.group_count(), 0);
    }

    #[test]
    fn observers_are_not_agents() {
        let table = ConnectionTable::default();
        let id = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(4);
        table.insert(id, Handshake::observer(None), tx, Utc::now());
        table.join(id, "branch:b1");

        assert!(table.agents_in("branch:b1").is_empty());
        assert_eq!(table.observers().len(), 1);
        assert_eq!(table.count(Role::Observer), 1);
    }

    #[test]
    fn full_queue_drops_frame() {
        let id = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(1);
        assert!(deliver(id, &tx, Outbound::Close));
        assert!(!deliver(id, &tx, Outbound::Close));
    }

    #[test]
    fn branch_group_names() {
        assert_eq!(branch_group("b1"), "branch:b1");
        assert_eq!(branch_of("branch:b1"), "b1");
        assert_eq!(company_group("acme"), "company:acme");
    }
}
