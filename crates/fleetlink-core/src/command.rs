// ── Command API ──
//
// Every device-facing request from the backend flows through a single
// `Command` enum. The fleet routes each variant to the gateway, and the
// outcome can always be flattened into a `DispatchOutcome` for callers
// that want a structured answer instead of an error.

use std::sync::Arc;

use fleetlink_api::protocol::{ControlRequest, PrintJobRequest, RawPrintRequest, TestPrintRequest};
use serde::Serialize;

use crate::error::CoreError;
use crate::gateway::AgentReceipt;
use crate::model::{PrinterRegistration, PrinterStatus, TestOutcome};

/// All operations the backend can ask of the fleet.
#[derive(Debug, Clone)]
pub enum Command {
    TestPrint {
        branch_id: String,
        request: TestPrintRequest,
    },
    PrintJob {
        branch_id: String,
        request: PrintJobRequest,
    },
    RawPrint {
        branch_id: String,
        request: RawPrintRequest,
    },
    /// Record a printer found outside the agent's discovery loop.
    RegisterPrinter(PrinterRegistration),
    Control {
        branch_id: String,
        request: ControlRequest,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestPrint { .. } => "test_print",
            Self::PrintJob { .. } => "print_job",
            Self::RawPrint { .. } => "raw_print",
            Self::RegisterPrinter(_) => "register_printer",
            Self::Control { .. } => "control",
        }
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    TestPrint(TestOutcome),
    Delivered(AgentReceipt),
    Printer(Arc<PrinterStatus>),
}

/// Flattened outcome of a command, success or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub success: bool,
    pub message: String,
    /// Stable error code, see [`CoreError::code`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl DispatchOutcome {
    #[allow(clippy::cast_possible_truncation)]
    pub fn success(result: &CommandResult) -> Self {
        let (message, latency) = match result {
            CommandResult::TestPrint(outcome) => (outcome.message.clone(), Some(outcome.latency)),
            CommandResult::Delivered(receipt) => (
                receipt
                    .message
                    .clone()
                    .unwrap_or_else(|| "Delivered to agent".to_owned()),
                Some(receipt.latency),
            ),
            CommandResult::Printer(printer) => {
                (format!("Printer {} registered", printer.display_name()), None)
            }
        };
        Self {
            success: true,
            message,
            error: None,
            retryable: false,
            latency_ms: latency.map(|d| d.as_millis() as u64),
        }
    }

    pub fn failure(error: &CoreError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error: Some(error.code().to_owned()),
            retryable: error.is_retryable(),
            latency_ms: None,
        }
    }
}

impl From<&Result<CommandResult, CoreError>> for DispatchOutcome {
    fn from(result: &Result<CommandResult, CoreError>) -> Self {
        match result {
            Ok(r) => Self::success(r),
            Err(e) => Self::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn failure_carries_code_and_retry_hint() {
        let outcome = DispatchOutcome::failure(&CoreError::NoAgentConnected {
            branch_id: "b1".into(),
        });
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no_agent_connected"));
        assert!(outcome.retryable);
        assert!(outcome.message.contains("start the desktop app"));
    }

    #[test]
    fn success_reports_latency() {
        let result: Result<CommandResult, CoreError> = Ok(CommandResult::Delivered(AgentReceipt {
            printer_id: Some("p1".into()),
            message: None,
            latency: Duration::from_millis(840),
        }));
        let outcome = DispatchOutcome::from(&result);
        assert!(outcome.success);
        assert_eq!(outcome.latency_ms, Some(840));
        assert_eq!(outcome.message, "Delivered to agent");
    }
}
