// ── Runtime fleet configuration ──
//
// Everything a `Fleet` needs to run, already validated and typed.
// The binary builds a `FleetConfig` from fleetlink-config and hands it
// in; core never reads config files.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::alerts::AlertThresholds;
use crate::circuit::CircuitConfig;
use crate::discovery::DiscoveryConfig;
use crate::error::CoreError;
use crate::gateway::GatewayConfig;
use crate::latency::TimeoutPolicy;
use crate::registry::{DEFAULT_SERVICE_TYPE, RegistryConfig};

/// Cadence of the periodic observer broadcasts and alert pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervals {
    /// Full `status_bulk` frame to every observer. 0 = never.
    pub status_bulk: Duration,
    /// `analytics` snapshot. 0 = never.
    pub analytics: Duration,
    /// Alert evaluation pass. 0 = never.
    pub alert_check: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            status_bulk: Duration::from_secs(30),
            analytics: Duration::from_secs(60),
            alert_check: Duration::from_secs(30),
        }
    }
}

/// How the running gateway registers and announces itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Instance name, also the mDNS instance label.
    pub name: String,
    /// Registry type tag.
    pub service_type: String,
    /// Host to register. Defaults to the listener's address.
    pub host: Option<String>,
    pub capabilities: Vec<String>,
    /// Announce the gateway over multicast DNS.
    pub mdns: bool,
    /// DNS-SD type, fully qualified.
    pub mdns_service_type: String,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            name: "fleetlink-gateway".into(),
            service_type: "print-gateway".into(),
            host: None,
            capabilities: ["test_print", "print_job", "raw_print", "control"]
                .map(String::from)
                .to_vec(),
            mdns: true,
            mdns_service_type: DEFAULT_SERVICE_TYPE.into(),
        }
    }
}

/// Configuration for one fleet gateway process.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    /// Default thresholds for every circuit.
    pub circuit: CircuitConfig,
    /// Per-endpoint thresholds, keyed by printer id.
    pub circuit_overrides: BTreeMap<String, CircuitConfig>,
    pub timeouts: TimeoutPolicy,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub gateway: GatewayConfig,
    pub alerts: AlertThresholds,
    pub intervals: Intervals,
    pub service: ServiceIdentity,
}

impl FleetConfig {
    /// Check cross-field constraints the individual types cannot.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.circuit.validate()?;
        for (endpoint, config) in &self.circuit_overrides {
            config.validate().map_err(|e| match e {
                CoreError::Validation { field, reason } => CoreError::Validation {
                    field: format!("circuit.endpoints.{endpoint}.{field}"),
                    reason,
                },
                other => other,
            })?;
        }

        let t = &self.timeouts;
        if t.min_timeout > t.max_timeout {
            return Err(invalid("timeouts.min", "must not exceed timeouts.max"));
        }
        if !(t.safety_factor.is_finite() && t.safety_factor >= 1.0) {
            return Err(invalid("timeouts.safety_factor", "must be at least 1.0"));
        }
        if t.capacity == 0 {
            return Err(invalid("timeouts.capacity", "must be positive"));
        }

        let r = &self.registry;
        if r.heartbeat_interval.is_zero() || r.max_missed == 0 {
            return Err(invalid(
                "registry.heartbeat_interval",
                "heartbeat interval and max missed must be positive",
            ));
        }

        if self.discovery.alive_threshold > self.discovery.recent_threshold {
            return Err(invalid(
                "discovery.alive_threshold",
                "must not exceed discovery.recent_threshold",
            ));
        }

        if self.alerts.low_paper_percent > 100 {
            return Err(invalid("alerts.low_paper_percent", "must be within 0-100"));
        }
        if !(0.0..=1.0).contains(&self.alerts.error_ratio) {
            return Err(invalid("alerts.error_ratio", "must be within 0.0-1.0"));
        }

        if self.service.name.trim().is_empty() {
            return Err(invalid("service.name", "is required"));
        }
        if self.service.mdns && !self.service.mdns_service_type.ends_with(".local.") {
            return Err(invalid("service.mdns_service_type", "must end with '.local.'"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> CoreError {
    CoreError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_timeout_bounds_are_rejected() {
        let mut config = FleetConfig::default();
        config.timeouts.min_timeout = Duration::from_secs(200);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.min"), "{err}");
    }

    #[test]
    fn endpoint_overrides_are_validated_by_name() {
        let mut config = FleetConfig::default();
        config.circuit_overrides.insert(
            "p1".into(),
            CircuitConfig {
                success_threshold: 0,
                ..CircuitConfig::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circuit.endpoints.p1.success_threshold"), "{err}");
    }

    #[test]
    fn mdns_type_must_be_local() {
        let mut config = FleetConfig::default();
        config.service.mdns_service_type = "_fleetlink._tcp".into();
        assert!(config.validate().is_err());

        config.service.mdns = false;
        assert!(config.validate().is_ok());
    }
}
