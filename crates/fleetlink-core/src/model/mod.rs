// ── Domain model ──

pub mod alert;
pub mod event;
pub mod printer;

pub use alert::{Alert, AlertKind, Severity};
pub use event::{AgentPresence, FleetEvent, FleetSnapshot, JobState, JobUpdate, TestOutcome};
pub use printer::{FULL_PAPER, PrinterRegistration, PrinterState, PrinterStatus};
