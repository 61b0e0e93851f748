//! Configuration for the fleetlink gateway.
//!
//! One TOML file, layered with figment: built-in defaults, then the file,
//! then `FLEETLINK_` environment variables (`__` separates sections, so
//! `FLEETLINK_SERVER__BIND` sets `server.bind`). The result is validated
//! and translated into `fleetlink_core::FleetConfig`; core never sees
//! files or environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetlink_api::ServerConfig;
use fleetlink_core::{
    AlertThresholds, CircuitConfig, CoreError, DiscoveryConfig, FleetConfig, GatewayConfig,
    Intervals, RegistryConfig, ServiceIdentity, TimeoutPolicy,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "FLEETLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl From<CoreError> for ConfigError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Validation {
                field: "config".into(),
                reason: other.to_string(),
            },
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level file layout. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub service: ServiceSection,
    pub circuit: CircuitSection,
    pub timeouts: TimeoutSection,
    pub registry: RegistrySection,
    pub discovery: DiscoverySection,
    pub alerts: AlertSection,
    pub broadcast: BroadcastSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address for agent and observer sockets.
    pub bind: String,
    /// Frames queued per connection before new ones are dropped.
    pub outbound_buffer: usize,
    pub max_frame_bytes: usize,
    /// Extra time an expired request may stay in the correlation table.
    pub correlation_grace_secs: u64,
    pub sweep_interval_secs: u64,
    pub event_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        let gateway = GatewayConfig::default();
        Self {
            bind: "0.0.0.0:8787".into(),
            outbound_buffer: server.outbound_buffer,
            max_frame_bytes: server.max_frame_bytes,
            correlation_grace_secs: gateway.correlation_grace.as_secs(),
            sweep_interval_secs: gateway.sweep_interval.as_secs(),
            event_capacity: gateway.event_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    /// Registry type tag of this gateway.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Advertised host. Defaults to the bound address.
    pub host: Option<String>,
    pub capabilities: Vec<String>,
    pub mdns: bool,
    pub mdns_type: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        let identity = ServiceIdentity::default();
        Self {
            name: identity.name,
            service_type: identity.service_type,
            host: identity.host,
            capabilities: identity.capabilities,
            mdns: identity.mdns,
            mdns_type: identity.mdns_service_type,
        }
    }
}

/// Circuit thresholds. `endpoints` overrides them per printer id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
    pub monitoring_window_secs: u64,
    pub endpoints: BTreeMap<String, CircuitOverride>,
}

impl Default for CircuitSection {
    fn default() -> Self {
        let c = CircuitConfig::default();
        Self {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            open_timeout_secs: c.open_timeout.as_secs(),
            monitoring_window_secs: c.monitoring_window.as_secs(),
            endpoints: BTreeMap::new(),
        }
    }
}

/// Partial circuit thresholds; unset fields inherit the section defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_window_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub safety_factor: f64,
    pub min_secs: u64,
    pub max_secs: u64,
    /// Successful samples kept per endpoint.
    pub capacity: usize,
    pub min_samples: u64,
    pub min_successful: usize,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        let p = TimeoutPolicy::default();
        Self {
            safety_factor: p.safety_factor,
            min_secs: p.min_timeout.as_secs(),
            max_secs: p.max_timeout.as_secs(),
            capacity: p.capacity,
            min_samples: p.min_samples,
            min_successful: p.min_successful,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySection {
    pub heartbeat_interval_secs: u64,
    pub max_missed: u32,
    pub check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub cleanup_cycles: u32,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let r = RegistryConfig::default();
        Self {
            heartbeat_interval_secs: r.heartbeat_interval.as_secs(),
            max_missed: r.max_missed,
            check_interval_secs: r.check_interval.as_secs(),
            cleanup_interval_secs: r.cleanup_interval.as_secs(),
            cleanup_cycles: r.cleanup_cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub retention_hours: u64,
    pub alive_threshold_secs: u64,
    pub recent_threshold_secs: u64,
    pub per_branch_cap: usize,
    pub prune_interval_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let d = DiscoveryConfig::default();
        Self {
            retention_hours: d.retention.as_secs() / 3600,
            alive_threshold_secs: d.alive_threshold.as_secs(),
            recent_threshold_secs: d.recent_threshold.as_secs(),
            per_branch_cap: d.per_branch_cap,
            prune_interval_secs: d.prune_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertSection {
    pub low_paper_percent: u8,
    pub overheat_celsius: f32,
    pub offline_after_secs: u64,
    pub error_ratio: f64,
    pub error_min_jobs: u64,
    pub check_interval_secs: u64,
}

impl Default for AlertSection {
    fn default() -> Self {
        let a = AlertThresholds::default();
        Self {
            low_paper_percent: a.low_paper_percent,
            overheat_celsius: a.overheat_celsius,
            offline_after_secs: a.offline_after.as_secs(),
            error_ratio: a.error_ratio,
            error_min_jobs: a.error_min_jobs,
            check_interval_secs: Intervals::default().alert_check.as_secs(),
        }
    }
}

/// Observer broadcast cadence. 0 disables a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub status_bulk_secs: u64,
    pub analytics_secs: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        let i = Intervals::default();
        Self {
            status_bulk_secs: i.status_bulk.as_secs(),
            analytics_secs: i.analytics.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when neither `RUST_LOG` nor `-v` is set.
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily-rotated log files. Unset logs to stderr only.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            directory: None,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "fleetlink", "fleetlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("fleetlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// The layered provider stack: defaults < file < environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load from `path`, or the platform path when `None`. A missing file is
/// not an error; defaults and environment still apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Write `cfg` as TOML to `path`, creating parent directories. Refuses to
/// overwrite unless `force` is set.
pub fn save_config(cfg: &Config, path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Parsed listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::Validation {
                field: "server.bind".into(),
                reason: format!("expected host:port, got '{}'", self.server.bind),
            })
    }

    /// Validate and build the runtime configuration.
    pub fn to_fleet_config(&self) -> Result<FleetConfig, ConfigError> {
        self.bind_addr()?;
        if self.server.outbound_buffer == 0 {
            return Err(invalid("server.outbound_buffer", "must be positive"));
        }
        if self.server.event_capacity == 0 {
            return Err(invalid("server.event_capacity", "must be positive"));
        }

        let circuit = CircuitConfig {
            failure_threshold: self.circuit.failure_threshold,
            success_threshold: self.circuit.success_threshold,
            open_timeout: secs(self.circuit.open_timeout_secs),
            monitoring_window: secs(self.circuit.monitoring_window_secs),
        };
        let circuit_overrides = self
            .circuit
            .endpoints
            .iter()
            .map(|(endpoint, o)| {
                let config = CircuitConfig {
                    failure_threshold: o.failure_threshold.unwrap_or(circuit.failure_threshold),
                    success_threshold: o.success_threshold.unwrap_or(circuit.success_threshold),
                    open_timeout: o.open_timeout_secs.map_or(circuit.open_timeout, secs),
                    monitoring_window: o
                        .monitoring_window_secs
                        .map_or(circuit.monitoring_window, secs),
                };
                (endpoint.clone(), config)
            })
            .collect();

        let config = FleetConfig {
            circuit,
            circuit_overrides,
            timeouts: TimeoutPolicy {
                capacity: self.timeouts.capacity,
                safety_factor: self.timeouts.safety_factor,
                min_timeout: secs(self.timeouts.min_secs),
                max_timeout: secs(self.timeouts.max_secs),
                min_samples: self.timeouts.min_samples,
                min_successful: self.timeouts.min_successful,
            },
            registry: RegistryConfig {
                heartbeat_interval: secs(self.registry.heartbeat_interval_secs),
                max_missed: self.registry.max_missed,
                check_interval: secs(self.registry.check_interval_secs),
                cleanup_interval: secs(self.registry.cleanup_interval_secs),
                cleanup_cycles: self.registry.cleanup_cycles,
            },
            discovery: DiscoveryConfig {
                retention: secs(self.discovery.retention_hours.saturating_mul(3600)),
                alive_threshold: secs(self.discovery.alive_threshold_secs),
                recent_threshold: secs(self.discovery.recent_threshold_secs),
                per_branch_cap: self.discovery.per_branch_cap,
                prune_interval: secs(self.discovery.prune_interval_secs),
            },
            gateway: GatewayConfig {
                server: ServerConfig {
                    outbound_buffer: self.server.outbound_buffer,
                    max_frame_bytes: self.server.max_frame_bytes,
                },
                correlation_grace: secs(self.server.correlation_grace_secs),
                sweep_interval: secs(self.server.sweep_interval_secs),
                event_capacity: self.server.event_capacity,
            },
            alerts: AlertThresholds {
                low_paper_percent: self.alerts.low_paper_percent,
                overheat_celsius: self.alerts.overheat_celsius,
                offline_after: secs(self.alerts.offline_after_secs),
                error_ratio: self.alerts.error_ratio,
                error_min_jobs: self.alerts.error_min_jobs,
            },
            intervals: Intervals {
                status_bulk: secs(self.broadcast.status_bulk_secs),
                analytics: secs(self.broadcast.analytics_secs),
                alert_check: secs(self.alerts.check_interval_secs),
            },
            service: ServiceIdentity {
                name: self.service.name.clone(),
                service_type: self.service.service_type.clone(),
                host: self.service.host.clone().filter(|h| !h.trim().is_empty()),
                capabilities: self.service.capabilities.clone(),
                mdns: self.service.mdns,
                mdns_service_type: self.service.mdns_type.clone(),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
