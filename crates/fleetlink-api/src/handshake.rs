//! Connection handshake: who is on the other end of a socket.
//!
//! Peers identify themselves through the query string of the upgrade
//! request, e.g. `ws://gateway:4100/?role=agent&companyId=c1&branchId=b1&deviceId=d1`.
//! Both camelCase and snake_case keys are accepted since desktop agents
//! and dashboards were written against different conventions.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;
use uuid::Uuid;

use crate::error::Error;

// ── ConnectionId ─────────────────────────────────────────────────────

/// Opaque identifier assigned to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Role ─────────────────────────────────────────────────────────────

/// What a connection is allowed to do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    /// Desktop print agent owning physical printers. Receives commands.
    Agent,
    /// Dashboard connection. Receives broadcasts only.
    Observer,
}

// ── Handshake ────────────────────────────────────────────────────────

/// Identity and tenant scope announced by a peer when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub role: Role,
    pub company_id: Option<String>,
    pub branch_id: Option<String>,
    pub device_id: Option<String>,
}

impl Handshake {
    /// Agent handshake for the given tenant scope.
    pub fn agent(
        company_id: impl Into<String>,
        branch_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Agent,
            company_id: Some(company_id.into()),
            branch_id: Some(branch_id.into()),
            device_id: Some(device_id.into()),
        }
    }

    /// Observer handshake, optionally scoped to a company.
    pub fn observer(company_id: Option<String>) -> Self {
        Self {
            role: Role::Observer,
            company_id,
            branch_id: None,
            device_id: None,
        }
    }

    /// Parse a handshake from the query part of an upgrade request URI.
    ///
    /// Agents must carry both a company and a branch; observers may
    /// omit every scope field.
    pub fn from_query(query: Option<&str>) -> Result<Self, Error> {
        let mut role = None;
        let mut company_id = None;
        let mut branch_id = None;
        let mut device_id = None;

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "role" | "clientType" | "client_type" => {
                    role = Some(value.parse::<Role>().map_err(|_| Error::InvalidHandshake {
                        reason: format!("unknown role '{value}'"),
                    })?);
                }
                "companyId" | "company_id" => company_id = Some(value.to_owned()),
                "branchId" | "branch_id" => branch_id = Some(value.to_owned()),
                "deviceId" | "device_id" => device_id = Some(value.to_owned()),
                _ => {}
            }
        }

        let role = role.ok_or_else(|| Error::InvalidHandshake {
            reason: "missing 'role' parameter".into(),
        })?;

        let handshake = Self {
            role,
            company_id,
            branch_id,
            device_id,
        };
        handshake.validate()?;
        Ok(handshake)
    }

    /// Check the role-specific scope requirements.
    pub fn validate(&self) -> Result<(), Error> {
        if self.role == Role::Agent {
            if self.company_id.is_none() {
                return Err(Error::InvalidHandshake {
                    reason: "agent connections require 'companyId'".into(),
                });
            }
            if self.branch_id.is_none() {
                return Err(Error::InvalidHandshake {
                    reason: "agent connections require 'branchId'".into(),
                });
            }
        }
        Ok(())
    }

    /// Append this handshake to a gateway URL as query parameters.
    pub fn apply_to(&self, base: &Url) -> Url {
        let mut url = base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.append_pair("role", &self.role.to_string());
            if let Some(ref company) = self.company_id {
                pairs.append_pair("companyId", company);
            }
            if let Some(ref branch) = self.branch_id {
                pairs.append_pair("branchId", branch);
            }
            if let Some(ref device) = self.device_id {
                pairs.append_pair("deviceId", device);
            }
        }
        url
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_agent_with_camel_case_keys() {
        let hs = Handshake::from_query(Some(
            "role=agent&companyId=c1&branchId=b1&deviceId=pc-01",
        ))
        .unwrap();
        assert_eq!(hs, Handshake::agent("c1", "b1", "pc-01"));
    }

    #[test]
    fn parses_snake_case_keys_and_legacy_client_type() {
        let hs =
            Handshake::from_query(Some("client_type=Agent&company_id=c1&branch_id=b1")).unwrap();
        assert_eq!(hs.role, Role::Agent);
        assert_eq!(hs.branch_id.as_deref(), Some("b1"));
        assert!(hs.device_id.is_none());
    }

    #[test]
    fn observer_needs_no_scope() {
        let hs = Handshake::from_query(Some("role=observer")).unwrap();
        assert_eq!(hs, Handshake::observer(None));
    }

    #[test]
    fn agent_without_branch_is_rejected() {
        let err = Handshake::from_query(Some("role=agent&companyId=c1")).unwrap_err();
        assert!(err.to_string().contains("branchId"), "{err}");
    }

    #[test]
    fn missing_role_is_rejected() {
        let err = Handshake::from_query(None).unwrap_err();
        assert!(matches!(err, Error::InvalidHandshake { .. }));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = Handshake::from_query(Some("role=printer")).unwrap_err();
        assert!(err.to_string().contains("printer"));
    }

    #[test]
    fn apply_to_round_trips_through_query() {
        let base = Url::parse("ws://127.0.0.1:4100/").unwrap();
        let hs = Handshake::agent("acme", "main st", "till-2");
        let url = hs.apply_to(&base);
        assert_eq!(Handshake::from_query(url.query()).unwrap(), hs);
    }
}
