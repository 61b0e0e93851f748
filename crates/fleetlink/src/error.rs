//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use fleetlink_config::ConfigError;
use fleetlink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(
        code(fleetlink::validation),
        help("Fix the value in the config file, or override it with FLEETLINK_<SECTION>__<KEY>.")
    )]
    Validation { field: String, reason: String },

    #[error("Config file already exists: {path}")]
    #[diagnostic(
        code(fleetlink::config_exists),
        help("Pass --force to overwrite it, or edit it in place.")
    )]
    ConfigExists { path: String },

    #[error("Could not load configuration")]
    #[diagnostic(
        code(fleetlink::config),
        help("Check the TOML syntax and the FLEETLINK_* environment variables.\nRun: fleetlink config path")
    )]
    Config(#[source] ConfigError),

    // ── Network ──────────────────────────────────────────────────────
    #[error("Could not listen on {addr}")]
    #[diagnostic(
        code(fleetlink::bind),
        help("Is another gateway already running? Pick a free port with --bind.")
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No print agent connected for branch {branch_id}")]
    #[diagnostic(
        code(fleetlink::no_agent),
        help("Start the desktop print agent at that branch.")
    )]
    NoAgent { branch_id: String },

    #[error("{message}")]
    #[diagnostic(code(fleetlink::circuit_open), help("Wait for the circuit to half-open, then retry."))]
    CircuitOpen { message: String },

    #[error("{message}")]
    #[diagnostic(code(fleetlink::timeout))]
    Timeout { message: String },

    #[error("{resource} '{identifier}' not found")]
    #[diagnostic(code(fleetlink::not_found))]
    NotFound { resource: String, identifier: String },

    // ── Everything else ──────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(fleetlink::core))]
    Core(CoreError),

    #[error(transparent)]
    #[diagnostic(code(fleetlink::transport))]
    Transport(#[from] fleetlink_api::Error),

    #[error("Failed to render configuration: {0}")]
    #[diagnostic(code(fleetlink::toml))]
    Toml(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::Config(_) => exit_code::USAGE,
            Self::ConfigExists { .. } => exit_code::CONFLICT,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Bind { .. } | Self::NoAgent { .. } | Self::CircuitOpen { .. } | Self::Transport(_) => {
                exit_code::CONNECTION
            }
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Core(_) | Self::Toml(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── Error mapping ────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation { field, reason } => Self::Validation { field, reason },
            CoreError::NoAgentConnected { branch_id } => Self::NoAgent { branch_id },
            err @ CoreError::CircuitOpen { .. } => Self::CircuitOpen {
                message: err.to_string(),
            },
            err @ CoreError::Timeout { .. } => Self::Timeout {
                message: err.to_string(),
            },
            CoreError::PrinterNotFound { printer_id } => Self::NotFound {
                resource: "printer".into(),
                identifier: printer_id,
            },
            CoreError::ServiceNotFound { id } => Self::NotFound {
                resource: "service".into(),
                identifier: id,
            },
            CoreError::Transport(source) => Self::Transport(source),
            other => Self::Core(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::AlreadyExists(path) => Self::ConfigExists {
                path: path.display().to_string(),
            },
            ConfigError::Io(source) => Self::Io(source),
            ConfigError::Serialization(source) => Self::Toml(source),
            other @ ConfigError::Figment(_) => Self::Config(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn dispatch_failures_keep_distinct_exit_codes() {
        let no_agent: CliError = CoreError::NoAgentConnected {
            branch_id: "b1".into(),
        }
        .into();
        let timeout: CliError = CoreError::Timeout {
            operation: "test_print".into(),
            after: Duration::from_secs(3),
        }
        .into();
        assert_eq!(no_agent.exit_code(), exit_code::CONNECTION);
        assert_eq!(timeout.exit_code(), exit_code::TIMEOUT);
        assert!(timeout.to_string().contains("did not respond"));
    }

    #[test]
    fn config_validation_is_a_usage_error() {
        let err: CliError = ConfigError::Validation {
            field: "server.bind".into(),
            reason: "expected host:port".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::USAGE);
        assert!(err.to_string().contains("server.bind"));
    }
}
