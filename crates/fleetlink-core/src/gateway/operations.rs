// ── Device operations ──
//
// Each operation is one `send_correlated` round trip wrapped by the
// circuit breaker and the latency tracker, both keyed by printer id.
// Control requests have no printer endpoint: they are tracked per branch
// and never breaker-guarded.

use std::sync::Arc;
use std::time::Duration;

use fleetlink_api::protocol::{
    AgentCommand, ControlRequest, PrintJobRequest, RawPrintRequest, TestPrintRequest,
};
use fleetlink_api::AgentMessage;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Gateway, ReplyMatcher, branch_group};
use crate::error::CoreError;
use crate::latency::OperationKind;
use crate::model::{FleetEvent, JobState, JobUpdate, TestOutcome};

/// Successful agent reply to a device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReceipt {
    pub printer_id: Option<String>,
    pub message: Option<String>,
    #[serde(with = "crate::latency::duration_ms")]
    pub latency: Duration,
}

impl Gateway {
    /// Print a test page and report the outcome to observers.
    pub async fn test_print(
        &self,
        branch_id: &str,
        request: TestPrintRequest,
    ) -> Result<TestOutcome, CoreError> {
        require("branchId", branch_id)?;
        require("printerId", &request.printer_id)?;
        let printer_id = request.printer_id.clone();

        let matcher = {
            let printer_id = printer_id.clone();
            reply_matcher(move |m| {
                matches!(m, AgentMessage::TestResult(_)) && m.printer_id() == Some(printer_id.as_str())
            })
        };
        let result = self
            .guarded(
                branch_id,
                &printer_id,
                OperationKind::TestPrint,
                AgentCommand::TestPrint(request),
                matcher,
            )
            .await;

        let company_id = self
            .store
            .get(&printer_id)
            .map(|p| p.company_id.clone())
            .unwrap_or_default();
        let outcome = |success: bool, message: String, latency: Duration| TestOutcome {
            printer_id: printer_id.clone(),
            company_id: company_id.clone(),
            branch_id: branch_id.to_owned(),
            success,
            message,
            latency,
        };

        match result {
            Ok(receipt) => {
                let message = receipt
                    .message
                    .unwrap_or_else(|| "Test print completed".to_owned());
                let done = outcome(true, message, receipt.latency);
                self.broadcast_status(FleetEvent::TestResult(done.clone()));
                Ok(done)
            }
            Err(e) => {
                // Every failed attempt reaches observers.
                let message = match e {
                    CoreError::OperationFailed { ref message, .. } => message.clone(),
                    ref other => other.to_string(),
                };
                let failed = outcome(false, message, Duration::ZERO);
                self.broadcast_status(FleetEvent::TestResult(failed));
                Err(e)
            }
        }
    }

    /// Send a rendered document. Resolves on `job_completed` or
    /// `job_failed` for the same job; `job_started` is progress only.
    pub async fn print_job(
        &self,
        branch_id: &str,
        request: PrintJobRequest,
    ) -> Result<AgentReceipt, CoreError> {
        require("branchId", branch_id)?;
        require("jobId", &request.job_id)?;
        require("printerId", &request.printer_id)?;
        if request.copies == 0 {
            return Err(CoreError::Validation {
                field: "copies".into(),
                reason: "must be at least 1".into(),
            });
        }

        let printer_id = request.printer_id.clone();
        let job_id = request.job_id.clone();

        if let Some(printer) = self.store.get(&printer_id) {
            self.broadcast_status(FleetEvent::JobUpdate(JobUpdate {
                job_id: job_id.clone(),
                printer_id: printer_id.clone(),
                company_id: printer.company_id.clone(),
                branch_id: branch_id.to_owned(),
                state: JobState::Queued,
                error: None,
            }));
        }

        let matcher = reply_matcher(move |m| {
            matches!(m, AgentMessage::JobCompleted(_) | AgentMessage::JobFailed(_))
                && m.job_id() == Some(job_id.as_str())
        });
        self.guarded(
            branch_id,
            &printer_id,
            OperationKind::PrintJob,
            AgentCommand::PrintJob(request),
            matcher,
        )
        .await
    }

    /// Pass an opaque device payload through to the printer.
    pub async fn raw_print(
        &self,
        branch_id: &str,
        request: RawPrintRequest,
    ) -> Result<AgentReceipt, CoreError> {
        require("branchId", branch_id)?;
        require("printerId", &request.printer_id)?;
        require("data", &request.data)?;

        let printer_id = request.printer_id.clone();
        let matcher = {
            let printer_id = printer_id.clone();
            reply_matcher(move |m| {
                matches!(m, AgentMessage::RawPrintResult(_)) && m.printer_id() == Some(printer_id.as_str())
            })
        };
        self.guarded(
            branch_id,
            &printer_id,
            OperationKind::RawPrint,
            AgentCommand::RawPrint(request),
            matcher,
        )
        .await
    }

    /// Agent-level control action (restart discovery, reload config, ...).
    pub async fn control(
        &self,
        branch_id: &str,
        request: ControlRequest,
    ) -> Result<AgentReceipt, CoreError> {
        require("branchId", branch_id)?;
        require("action", &request.action)?;

        let target = request.printer_id.clone();
        let matcher = reply_matcher(move |m| {
            matches!(m, AgentMessage::ControlAck(_))
                && target.as_deref().is_none_or(|p| m.printer_id() == Some(p))
        });

        let endpoint = branch_group(branch_id);
        let kind = OperationKind::Control;
        let timeout = self.tracker.timeout(&endpoint, kind);
        let started = Instant::now();
        let result = self
            .send_correlated(&endpoint, AgentCommand::Control(request), Some(matcher), timeout)
            .await
            .and_then(|reply| receipt(&endpoint, kind, reply));
        let elapsed = started.elapsed();

        match result {
            Ok(_) => self.tracker.record(&endpoint, kind, elapsed, true),
            Err(ref e) if e.counts_against_circuit() => {
                self.tracker.record(&endpoint, kind, elapsed, false);
            }
            Err(_) => {}
        }
        result.map(|r| r.with_latency(elapsed))
    }

    /// Breaker permit → adaptive timeout → correlated round trip →
    /// outcome fed back to breaker and tracker.
    async fn guarded(
        &self,
        branch_id: &str,
        printer_id: &str,
        kind: OperationKind,
        command: AgentCommand,
        matcher: ReplyMatcher,
    ) -> Result<AgentReceipt, CoreError> {
        self.breaker.acquire(printer_id)?;

        let timeout = self.tracker.timeout(printer_id, kind);
        let started = Instant::now();
        let result = self
            .send_correlated(&branch_group(branch_id), command, Some(matcher), timeout)
            .await
            .and_then(|reply| receipt(printer_id, kind, reply));
        let elapsed = started.elapsed();

        match result {
            Ok(_) => {
                self.breaker.record_success(printer_id);
                self.tracker.record(printer_id, kind, elapsed, true);
                info!(printer = printer_id, operation = %kind, elapsed = ?elapsed, "operation succeeded");
            }
            Err(ref e) if e.counts_against_circuit() => {
                self.breaker.record_failure(printer_id, &e.to_string());
                self.tracker.record(printer_id, kind, elapsed, false);
            }
            // Topology problems say nothing about the printer.
            Err(ref e) => debug!(printer = printer_id, operation = %kind, error = %e, "operation not attempted"),
        }
        result.map(|r| r.with_latency(elapsed))
    }
}

impl AgentReceipt {
    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

fn reply_matcher(f: impl Fn(&AgentMessage) -> bool + Send + Sync + 'static) -> ReplyMatcher {
    Arc::new(f)
}

fn require(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation {
            field: field.into(),
            reason: "is required".into(),
        });
    }
    Ok(())
}

/// Turn an agent reply into a receipt, or an operation failure when the
/// agent reports one.
fn receipt(endpoint: &str, kind: OperationKind, reply: AgentMessage) -> Result<AgentReceipt, CoreError> {
    let failed = |message: String| CoreError::OperationFailed {
        endpoint: endpoint.to_owned(),
        operation: kind.to_string(),
        class: crate::circuit::classify(&message),
        message,
    };

    match reply {
        AgentMessage::TestResult(r) | AgentMessage::RawPrintResult(r) | AgentMessage::ControlAck(r) => {
            if r.success {
                Ok(AgentReceipt {
                    printer_id: r.printer_id,
                    message: r.message,
                    latency: Duration::ZERO,
                })
            } else {
                Err(failed(
                    r.message.unwrap_or_else(|| "agent reported failure".to_owned()),
                ))
            }
        }
        AgentMessage::JobCompleted(job) => Ok(AgentReceipt {
            printer_id: Some(job.printer_id),
            message: None,
            latency: Duration::ZERO,
        }),
        AgentMessage::JobFailed(job) => Err(failed(
            job.error.unwrap_or_else(|| "print job failed".to_owned()),
        )),
        other => Err(CoreError::Internal(format!(
            "unexpected {} reply to {kind}",
            other.kind()
        ))),
    }
}
