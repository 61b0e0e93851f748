// ── Registry operations surface ──
//
// Typed commands for ops tooling. Expected failures (unknown id, nothing
// healthy) come back as `success: false` responses, never as errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RegisterRequest, SelectionStrategy, ServiceFilter, ServiceRegistry};
use crate::error::CoreError;

/// One registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryCommand {
    Register(RegisterRequest),
    Unregister {
        id: String,
    },
    Heartbeat {
        id: String,
        #[serde(default)]
        metadata: Option<BTreeMap<String, String>>,
    },
    Health {
        id: String,
        healthy: bool,
    },
    Get {
        id: String,
    },
    List(ServiceFilter),
    Select {
        #[serde(rename = "type", alias = "serviceType")]
        service_type: String,
        #[serde(default)]
        strategy: SelectionStrategy,
    },
    Stats,
}

/// Structured outcome of a [`RegistryCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Machine-readable failure code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpsResponse {
    fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            error: None,
        }
    }

    fn failed(err: &CoreError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            error: Some(err.code().to_owned()),
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

impl ServiceRegistry {
    /// Execute an ops command.
    pub fn handle(&self, command: RegistryCommand) -> OpsResponse {
        match command {
            RegistryCommand::Register(request) => match self.register(request) {
                Ok(service) => OpsResponse::ok(
                    format!("Service {} registered", service.id),
                    to_data(&service),
                ),
                Err(e) => OpsResponse::failed(&e),
            },
            RegistryCommand::Unregister { id } => {
                if self.unregister(&id) {
                    OpsResponse::ok(format!("Service {id} unregistered"), None)
                } else {
                    OpsResponse::failed(&CoreError::ServiceNotFound { id })
                }
            }
            RegistryCommand::Heartbeat { id, metadata } => {
                if self.record_heartbeat(&id, metadata) {
                    OpsResponse::ok("Heartbeat recorded", None)
                } else {
                    OpsResponse::failed(&CoreError::ServiceNotFound { id })
                }
            }
            RegistryCommand::Health { id, healthy } => {
                if self.update_health(&id, healthy) {
                    let verdict = if healthy { "healthy" } else { "unhealthy" };
                    OpsResponse::ok(format!("Service {id} marked {verdict}"), None)
                } else {
                    OpsResponse::failed(&CoreError::ServiceNotFound { id })
                }
            }
            RegistryCommand::Get { id } => match self.get(&id) {
                Some(service) => OpsResponse::ok("Service found", to_data(&service)),
                None => OpsResponse::failed(&CoreError::ServiceNotFound { id }),
            },
            RegistryCommand::List(filter) => {
                let services = self.list(&filter);
                OpsResponse::ok(format!("{} service(s)", services.len()), to_data(&services))
            }
            RegistryCommand::Select {
                service_type,
                strategy,
            } => match self.select_best(&service_type, strategy) {
                Some(service) => OpsResponse::ok(
                    format!("Selected {} via {strategy}", service.id),
                    to_data(&service),
                ),
                None => OpsResponse::failed(&CoreError::NoHealthyService { service_type }),
            },
            RegistryCommand::Stats => OpsResponse::ok("Registry stats", to_data(&self.stats())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::clock::system_clock;
    use crate::registry::{NoopAdvertiser, RegistryConfig};

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(
            RegistryConfig::default(),
            system_clock(),
            Arc::new(NoopAdvertiser),
        )
    }

    #[test]
    fn commands_decode_from_ops_json() {
        let cmd: RegistryCommand = serde_json::from_value(json!({
            "op": "register",
            "name": "Gateway",
            "type": "gateway",
            "host": "10.0.0.2",
            "port": 7420
        }))
        .unwrap();
        assert!(matches!(cmd, RegistryCommand::Register(ref r) if r.service_type == "gateway"));

        let cmd: RegistryCommand =
            serde_json::from_value(json!({ "op": "select", "type": "gateway", "strategy": "round-robin" }))
                .unwrap();
        assert_eq!(
            cmd,
            RegistryCommand::Select {
                service_type: "gateway".into(),
                strategy: SelectionStrategy::RoundRobin
            }
        );
    }

    #[test]
    fn unknown_ids_are_structured_failures() {
        let reg = registry();
        for cmd in [
            RegistryCommand::Unregister { id: "ghost".into() },
            RegistryCommand::Heartbeat {
                id: "ghost".into(),
                metadata: None,
            },
            RegistryCommand::Health {
                id: "ghost".into(),
                healthy: true,
            },
            RegistryCommand::Get { id: "ghost".into() },
        ] {
            let resp = reg.handle(cmd);
            assert!(!resp.success);
            assert_eq!(resp.error.as_deref(), Some("registry_not_found"));
            assert!(resp.message.contains("ghost"));
        }
    }

    #[test]
    fn register_select_and_stats() {
        let reg = registry();
        let resp = reg.handle(RegistryCommand::Register(RegisterRequest {
            name: "Gateway".into(),
            service_type: "gateway".into(),
            host: "10.0.0.2".into(),
            port: 7420,
            ..RegisterRequest::default()
        }));
        assert!(resp.success, "{}", resp.message);
        assert_eq!(resp.data.unwrap()["id"], "gateway-10.0.0.2-7420");

        let resp = reg.handle(RegistryCommand::Select {
            service_type: "gateway".into(),
            strategy: SelectionStrategy::Priority,
        });
        assert!(resp.success);

        let resp = reg.handle(RegistryCommand::Select {
            service_type: "renderer".into(),
            strategy: SelectionStrategy::Priority,
        });
        assert_eq!(resp.error.as_deref(), Some("no_healthy_service"));

        let resp = reg.handle(RegistryCommand::Stats);
        assert_eq!(resp.data.unwrap()["total"], 1);
    }

    #[test]
    fn invalid_registration_reports_validation() {
        let reg = registry();
        let resp = reg.handle(RegistryCommand::Register(RegisterRequest::default()));
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("validation"));
    }
}
