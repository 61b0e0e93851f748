//! Reliability layer between printer agents and the cloud backend.
//!
//! This crate owns connection routing, failure isolation and liveness
//! tracking for a fleet of desktop print agents:
//!
//! - **[`Fleet`]**: central facade. [`start()`](Fleet::start) begins
//!   accepting agent and dashboard sockets and spawns the periodic jobs
//!   (heartbeat expiry, cleanup, alert evaluation, status broadcasts);
//!   [`execute()`](Fleet::execute) routes a [`Command`] to the gateway.
//!
//! - **[`Gateway`]**: connection table grouped by branch, and the
//!   correlation table behind [`send_correlated`](Gateway::send_correlated):
//!   fan a request out to every agent of a branch, first matching reply
//!   wins, timeouts and cancellation always deregister the request.
//!
//! - **[`CircuitBreaker`]**: per-endpoint CLOSED / OPEN / HALF_OPEN state
//!   machine with transient/permanent error classification.
//!
//! - **[`LatencyTracker`]**: per-endpoint latency percentiles and the
//!   adaptive timeout derived from them.
//!
//! - **[`ServiceRegistry`]**: backend service membership, heartbeat expiry,
//!   selection strategies and mDNS advertisement.
//!
//! - **[`HeartbeatAggregator`]**: discovery heartbeat history and
//!   per-company health.
//!
//! - **[`PrinterStore`]**: reactive printer status (`DashMap` + `watch`),
//!   subscribed through [`PrinterStream`].

pub mod alerts;
pub mod circuit;
pub mod clock;
pub mod command;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod latency;
pub mod model;
pub mod registry;
pub mod store;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use alerts::{AlertEngine, AlertEvaluation, AlertThresholds};
pub use circuit::{
    CircuitBreaker, CircuitConfig, CircuitMetrics, CircuitRecord, CircuitSnapshot, CircuitState,
    ErrorClass, classify,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use command::{Command, CommandResult, DispatchOutcome};
pub use config::{FleetConfig, Intervals, ServiceIdentity};
pub use discovery::{
    BranchStatus, CompanyStats, DiscoveryConfig, DiscoveryHeartbeat, HealthVerdict,
    HeartbeatAggregator,
};
pub use error::CoreError;
pub use fleet::Fleet;
pub use gateway::{AgentReceipt, ConnectionInfo, Gateway, GatewayConfig, ReplyMatcher};
pub use latency::{LatencyStats, LatencyTracker, OperationKind, TimeoutPolicy};
pub use registry::{
    OpsResponse, RegisterRequest, RegisteredService, RegistryCommand, RegistryConfig,
    RegistryStats, SelectionStrategy, ServiceFilter, ServiceRegistry,
};
pub use store::{PrinterSnapshot, PrinterStore, PrinterStream};
pub use supervisor::Supervisor;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    AgentPresence, Alert, AlertKind, FleetEvent, FleetSnapshot, JobState, JobUpdate,
    PrinterRegistration, PrinterState, PrinterStatus, Severity, TestOutcome,
};
