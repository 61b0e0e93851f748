//! `fleetlink simulate-agent`: a stand-in for the desktop print agent.
//!
//! Connects with an agent handshake, announces a handful of printers,
//! answers every command the gateway sends and reports status plus a
//! discovery heartbeat on a fixed cadence.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use fleetlink_api::client::{AgentLink, ReconnectConfig};
use fleetlink_api::protocol::{
    CommandReply, HeartbeatReport, JobReport, PrinterReport, SystemReport,
};
use fleetlink_api::{AgentCommand, AgentMessage, Handshake, PrinterState, ToAgent};

use crate::cli::SimulateArgs;
use crate::commands::shutdown_signal;
use crate::error::CliError;

/// Paper used per printed page, in percent.
const PAPER_PER_PAGE: u8 = 4;

pub async fn handle(args: &SimulateArgs) -> Result<(), CliError> {
    let gateway = Url::parse(&args.gateway).map_err(|e| CliError::Validation {
        field: "gateway".into(),
        reason: format!("invalid URL '{}': {e}", args.gateway),
    })?;
    if args.status_interval == 0 {
        return Err(CliError::Validation {
            field: "status-interval".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    let device = args
        .device
        .clone()
        .unwrap_or_else(|| format!("sim-{}", &Uuid::new_v4().simple().to_string()[..8]));
    let mut agent = SimulatedAgent::new(&device, args.printers, args.fail);

    let cancel = CancellationToken::new();
    let link = AgentLink::connect(
        gateway.clone(),
        Handshake::agent(&args.company, &args.branch, &device),
        ReconnectConfig::default(),
        cancel.clone(),
    );
    let mut inbound = link.subscribe();
    info!(
        gateway = %gateway,
        company = %args.company,
        branch = %args.branch,
        device = %device,
        printers = args.printers,
        "simulated agent starting"
    );

    for report in agent.reports() {
        link.send(AgentMessage::PrinterDiscovered(report)).await?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval));
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("simulated agent stopping");
                break;
            }
            _ = ticker.tick() => {
                for report in agent.reports() {
                    link.send(AgentMessage::PrinterStatus(report)).await?;
                }
                link.send(AgentMessage::DiscoveryHeartbeat(agent.heartbeat())).await?;
            }
            frame = inbound.recv() => match frame {
                Ok(frame) => {
                    for reply in agent.respond(&frame) {
                        debug!(kind = reply.kind(), printer = ?reply.printer_id(), "replying");
                        link.send(reply).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "agent fell behind gateway frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    link.shutdown();
    Ok(())
}

// ── Simulated agent state ────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimPrinter {
    id: String,
    name: String,
    paper_level: u8,
    temperature: f32,
}

impl SimPrinter {
    fn state(&self) -> PrinterState {
        match self.paper_level {
            0 => PrinterState::NoPaper,
            1..=10 => PrinterState::LowPaper,
            _ => PrinterState::Online,
        }
    }

    fn report(&self) -> PrinterReport {
        PrinterReport {
            printer_id: self.id.clone(),
            name: Some(self.name.clone()),
            model: Some("Simulated TM-T88".into()),
            status: Some(self.state()),
            paper_level: Some(self.paper_level),
            temperature: Some(self.temperature),
            queue_length: Some(0),
            connection_type: Some("network".into()),
            capabilities: Some(vec!["cut".into(), "raw".into()]),
        }
    }
}

/// Deterministic agent model: paper runs down as pages print and every
/// reply echoes the request's correlation id.
#[derive(Debug)]
struct SimulatedAgent {
    printers: Vec<SimPrinter>,
    fail: bool,
    cycles: u64,
    errors: u64,
    started: Instant,
}

impl SimulatedAgent {
    fn new(device: &str, count: u32, fail: bool) -> Self {
        let printers = (1..=count)
            .map(|i| SimPrinter {
                id: format!("{device}-p{i}"),
                name: format!("Printer {i}"),
                paper_level: 100,
                temperature: 38.0,
            })
            .collect();
        Self {
            printers,
            fail,
            cycles: 0,
            errors: 0,
            started: Instant::now(),
        }
    }

    fn reports(&self) -> Vec<PrinterReport> {
        self.printers.iter().map(SimPrinter::report).collect()
    }

    fn heartbeat(&mut self) -> HeartbeatReport {
        self.cycles += 1;
        HeartbeatReport {
            app_version: env!("CARGO_PKG_VERSION").into(),
            discovery_running: true,
            cached_printers: u32::try_from(self.printers.len()).unwrap_or(u32::MAX),
            total_cycles: self.cycles,
            error_count: self.errors,
            system: Some(SystemReport {
                platform: Some(std::env::consts::OS.into()),
                uptime_secs: Some(self.started.elapsed().as_secs()),
                ..SystemReport::default()
            }),
            ..HeartbeatReport::default()
        }
    }

    /// Print `pages` on `printer_id`. Returns the failure reason, if any.
    fn print(&mut self, printer_id: &str, pages: u32) -> Result<(), String> {
        let fail = self.fail;
        let Some(printer) = self.printers.iter_mut().find(|p| p.id == printer_id) else {
            self.errors += 1;
            return Err(format!("printer {printer_id} is not attached to this agent"));
        };
        if fail {
            self.errors += 1;
            return Err("paper jam".into());
        }
        if printer.paper_level == 0 {
            self.errors += 1;
            return Err("out of paper".into());
        }
        let used = u8::try_from(pages.saturating_mul(u32::from(PAPER_PER_PAGE))).unwrap_or(u8::MAX);
        printer.paper_level = printer.paper_level.saturating_sub(used);
        Ok(())
    }

    /// Replies owed for a gateway frame, in send order.
    fn respond(&mut self, frame: &ToAgent) -> Vec<AgentMessage> {
        let (correlation_id, command) = match frame {
            ToAgent::Welcome { connection_id } => {
                info!(connection = %connection_id.as_uuid(), "connected to gateway");
                return Vec::new();
            }
            ToAgent::Cancel { correlation_id } => {
                debug!(%correlation_id, "request cancelled by gateway");
                return Vec::new();
            }
            ToAgent::Request {
                correlation_id,
                command,
            } => (Some(*correlation_id), command),
        };

        match command {
            AgentCommand::TestPrint(req) => {
                let result = self.print(&req.printer_id, 1);
                vec![AgentMessage::TestResult(reply(
                    correlation_id,
                    Some(req.printer_id.clone()),
                    result,
                    "Test page printed",
                ))]
            }
            AgentCommand::RawPrint(req) => {
                let result = self.print(&req.printer_id, 1);
                vec![AgentMessage::RawPrintResult(reply(
                    correlation_id,
                    Some(req.printer_id.clone()),
                    result,
                    "Raw data sent",
                ))]
            }
            AgentCommand::PrintJob(req) => {
                let job = |error: Option<String>| JobReport {
                    job_id: req.job_id.clone(),
                    printer_id: req.printer_id.clone(),
                    correlation_id,
                    error,
                    duration_ms: Some(u64::from(req.copies) * 250),
                };
                let started = AgentMessage::JobStarted(job(None));
                let finished = match self.print(&req.printer_id, req.copies) {
                    Ok(()) => AgentMessage::JobCompleted(job(None)),
                    Err(reason) => AgentMessage::JobFailed(job(Some(reason))),
                };
                vec![started, finished]
            }
            AgentCommand::Control(req) => {
                if req.action == "refill" {
                    for printer in &mut self.printers {
                        if req.printer_id.as_deref().is_none_or(|id| id == printer.id) {
                            printer.paper_level = 100;
                        }
                    }
                }
                vec![AgentMessage::ControlAck(CommandReply {
                    correlation_id,
                    printer_id: req.printer_id.clone(),
                    success: true,
                    message: Some(format!("{} acknowledged", req.action)),
                })]
            }
        }
    }
}

fn reply(
    correlation_id: Option<Uuid>,
    printer_id: Option<String>,
    result: Result<(), String>,
    ok_message: &str,
) -> CommandReply {
    let (success, message) = match result {
        Ok(()) => (true, ok_message.to_owned()),
        Err(reason) => (false, reason),
    };
    CommandReply {
        correlation_id,
        printer_id,
        success,
        message: Some(message),
    }
}
