// ── Fleet facade ──
//
// Full lifecycle of one gateway process: builds the components from a
// `FleetConfig`, runs the accept loop and every periodic job under one
// supervisor, and routes backend commands to the gateway.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEngine, AlertEvaluation};
use crate::circuit::CircuitBreaker;
use crate::clock::{SharedClock, system_clock};
use crate::command::{Command, CommandResult, DispatchOutcome};
use crate::config::FleetConfig;
use crate::discovery::HeartbeatAggregator;
use crate::error::CoreError;
use crate::gateway::Gateway;
use crate::latency::LatencyTracker;
use crate::model::{Alert, FleetEvent, FleetSnapshot, PrinterRegistration, PrinterStatus};
use crate::registry::{
    Advertisement, Advertiser, MdnsAdvertiser, NoopAdvertiser, OpsResponse, RegisterRequest,
    RegistryCommand, ServiceRegistry,
};
use crate::store::{PrinterSnapshot, PrinterStore};
use crate::supervisor::Supervisor;

// ── Fleet ────────────────────────────────────────────────────────────

/// The main entry point for the gateway process.
///
/// Cheaply cloneable. [`new`](Self::new) only wires components together;
/// [`start`](Self::start) begins accepting agents and spawns background
/// work, [`stop`](Self::stop) tears all of it down.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    config: FleetConfig,
    gateway: Arc<Gateway>,
    registry: Arc<ServiceRegistry>,
    discovery: Arc<HeartbeatAggregator>,
    alerts: Arc<AlertEngine>,
    running: Mutex<Option<Running>>,
}

/// State that exists only between `start` and `stop`.
struct Running {
    supervisor: Arc<Supervisor>,
    local_addr: SocketAddr,
    service_id: Option<String>,
}

impl Fleet {
    /// Build a fleet on the system clock. mDNS is used when the config
    /// enables it.
    pub fn new(config: FleetConfig) -> Result<Self, CoreError> {
        let advertiser: Arc<dyn Advertiser> = if config.service.mdns {
            Arc::new(MdnsAdvertiser::new())
        } else {
            Arc::new(NoopAdvertiser)
        };
        Self::with_parts(config, system_clock(), advertiser)
    }

    /// Build a fleet with an explicit clock and advertiser.
    pub fn with_parts(
        config: FleetConfig,
        clock: SharedClock,
        advertiser: Arc<dyn Advertiser>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let store = Arc::new(PrinterStore::new());
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone(), Arc::clone(&clock)));
        for (endpoint, overrides) in &config.circuit_overrides {
            breaker.configure(endpoint, overrides.clone())?;
        }
        let tracker = Arc::new(LatencyTracker::new(config.timeouts.clone()));
        let discovery = Arc::new(HeartbeatAggregator::new(
            config.discovery.clone(),
            Arc::clone(&clock),
        ));
        let gateway = Arc::new(Gateway::new(
            config.gateway.clone(),
            store,
            breaker,
            tracker,
            Arc::clone(&discovery),
            Arc::clone(&clock),
        ));
        let registry = Arc::new(ServiceRegistry::new(
            config.registry.clone(),
            Arc::clone(&clock),
            advertiser,
        ));
        let alerts = Arc::new(AlertEngine::new(config.alerts.clone(), clock));

        Ok(Self {
            inner: Arc::new(FleetInner {
                config,
                gateway,
                registry,
                discovery,
                alerts,
                running: Mutex::new(None),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.inner.gateway
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    pub fn discovery(&self) -> &Arc<HeartbeatAggregator> {
        &self.inner.discovery
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.gateway.breaker()
    }

    pub fn tracker(&self) -> &Arc<LatencyTracker> {
        self.inner.gateway.tracker()
    }

    pub fn store(&self) -> &Arc<PrinterStore> {
        self.inner.gateway.store()
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.inner.alerts
    }

    /// Every event broadcast to observers.
    pub fn events(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.gateway.subscribe()
    }

    pub fn printers(&self) -> PrinterSnapshot {
        self.store().snapshot()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.inner.gateway.snapshot()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner.alerts.active()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Address the gateway is accepting on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    /// Registry id of this gateway, while running.
    pub fn service_id(&self) -> Option<String> {
        self.running().as_ref().and_then(|r| r.service_id.clone())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start accepting agent and observer connections on `listener` and
    /// spawn the periodic jobs. Must be called inside a tokio runtime.
    ///
    /// Registers the gateway in its own registry and announces it over
    /// mDNS; neither failure is fatal.
    pub fn start(&self, listener: TcpListener) -> Result<SocketAddr, CoreError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(CoreError::Internal("fleet already started".into()));
        }

        let local_addr = listener.local_addr().map_err(fleetlink_api::Error::from)?;
        let supervisor = Arc::new(Supervisor::new());

        // Accept loop
        let gateway = Arc::clone(&self.inner.gateway);
        let server = self.inner.config.gateway.server.clone();
        let cancel = supervisor.token();
        supervisor.spawn("gateway", async move {
            if let Err(e) = fleetlink_api::server::serve(listener, gateway, server, cancel).await {
                error!(error = %e, "gateway accept loop failed");
            }
        });

        self.spawn_periodic_jobs(&supervisor);
        let service_id = self.register_self(&supervisor, local_addr);

        info!(
            addr = %local_addr,
            tasks = supervisor.task_count(),
            "fleet started"
        );
        *running = Some(Running {
            supervisor,
            local_addr,
            service_id,
        });
        Ok(local_addr)
    }

    /// Stop every background task, close all sockets, withdraw the mDNS
    /// announcement and unregister this gateway. No-op when stopped.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };

        self.inner.registry.withdraw();
        if let Some(id) = &running.service_id {
            self.inner.registry.unregister(id);
        }
        running.supervisor.shutdown().await;
        info!(addr = %running.local_addr, "fleet stopped");
    }

    fn spawn_periodic_jobs(&self, supervisor: &Supervisor) {
        let config = &self.inner.config;

        let registry = Arc::clone(&self.inner.registry);
        supervisor.spawn_periodic("registry-heartbeats", config.registry.check_interval, move || {
            registry.check_heartbeats();
        });

        let registry = Arc::clone(&self.inner.registry);
        supervisor.spawn_periodic("registry-cleanup", config.registry.cleanup_interval, move || {
            registry.cleanup();
        });

        let discovery = Arc::clone(&self.inner.discovery);
        supervisor.spawn_periodic("discovery-prune", config.discovery.prune_interval, move || {
            let removed = discovery.prune();
            if removed > 0 {
                debug!(removed, "pruned discovery heartbeats");
            }
        });

        let gateway = Arc::clone(&self.inner.gateway);
        supervisor.spawn_periodic("correlation-sweep", config.gateway.sweep_interval, move || {
            gateway.sweep_expired();
        });

        let gateway = Arc::clone(&self.inner.gateway);
        let alerts = Arc::clone(&self.inner.alerts);
        supervisor.spawn_periodic("alerts", config.intervals.alert_check, move || {
            run_alert_pass(&alerts, &gateway);
        });

        let gateway = Arc::clone(&self.inner.gateway);
        supervisor.spawn_periodic("status-bulk", config.intervals.status_bulk, move || {
            gateway.broadcast_status(FleetEvent::StatusBulk(gateway.store().snapshot()));
        });

        let gateway = Arc::clone(&self.inner.gateway);
        supervisor.spawn_periodic("analytics", config.intervals.analytics, move || {
            gateway.broadcast_status(FleetEvent::Analytics(gateway.snapshot()));
        });
    }

    /// Self-registration, its heartbeat, and the mDNS announcement.
    fn register_self(&self, supervisor: &Supervisor, addr: SocketAddr) -> Option<String> {
        let service = &self.inner.config.service;
        let registry = &self.inner.registry;

        let request = RegisterRequest {
            id: None,
            name: service.name.clone(),
            service_type: service.service_type.clone(),
            host: service.host.clone().unwrap_or_else(|| addr.ip().to_string()),
            port: addr.port(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            capabilities: service.capabilities.clone(),
            priority: None,
            metadata: std::iter::once(("instance".to_owned(), service.name.clone())).collect(),
        };
        let service_id = match registry.register(request) {
            Ok(registered) => {
                let id = registered.id;
                let heartbeat = Arc::clone(registry);
                let beat_id = id.clone();
                supervisor.spawn_periodic(
                    "self-heartbeat",
                    self.inner.config.registry.heartbeat_interval,
                    move || {
                        heartbeat.record_heartbeat(&beat_id, None);
                    },
                );
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "gateway self-registration failed");
                None
            }
        };

        if service.mdns {
            let properties: HashMap<String, String> = [
                ("version".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
                ("type".to_owned(), service.service_type.clone()),
                ("capabilities".to_owned(), service.capabilities.join(",")),
            ]
            .into_iter()
            .collect();
            registry.advertise(&Advertisement {
                instance: service.name.clone(),
                service_type: service.mdns_service_type.clone(),
                port: addr.port(),
                properties,
            });
        }
        service_id
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Execute a backend command.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CoreError> {
        if !self.is_running() {
            return Err(CoreError::NotRunning);
        }

        let gateway = &self.inner.gateway;
        match command {
            Command::TestPrint { branch_id, request } => gateway
                .test_print(&branch_id, request)
                .await
                .map(CommandResult::TestPrint),
            Command::PrintJob { branch_id, request } => gateway
                .print_job(&branch_id, request)
                .await
                .map(CommandResult::Delivered),
            Command::RawPrint { branch_id, request } => gateway
                .raw_print(&branch_id, request)
                .await
                .map(CommandResult::Delivered),
            Command::Control { branch_id, request } => gateway
                .control(&branch_id, request)
                .await
                .map(CommandResult::Delivered),
            Command::RegisterPrinter(registration) => {
                self.register_printer(registration).map(CommandResult::Printer)
            }
        }
    }

    /// Execute a command and flatten the result for API responses.
    pub async fn dispatch(&self, command: Command) -> DispatchOutcome {
        let name = command.name();
        let result = self.execute(command).await;
        if let Err(ref e) = result {
            debug!(command = name, code = e.code(), error = %e, "command failed");
        }
        DispatchOutcome::from(&result)
    }

    /// Record a printer found outside the agent's discovery loop and
    /// broadcast it when anything changed.
    pub fn register_printer(
        &self,
        registration: PrinterRegistration,
    ) -> Result<Arc<PrinterStatus>, CoreError> {
        for (field, value) in [
            ("printerId", &registration.printer_id),
            ("companyId", &registration.company_id),
            ("branchId", &registration.branch_id),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::Validation {
                    field: field.into(),
                    reason: "is required".into(),
                });
            }
        }

        let store = self.store();
        let printer_id = registration.printer_id.clone();
        let changed = store.upsert_with(
            &registration.printer_id,
            &registration.company_id,
            &registration.branch_id,
            |p| {
                if registration.name.is_some() {
                    p.name = registration.name;
                }
                if registration.model.is_some() {
                    p.model = registration.model;
                }
                if registration.connection_type.is_some() {
                    p.connection_type = registration.connection_type;
                }
                if !registration.capabilities.is_empty() {
                    p.capabilities = registration.capabilities;
                }
            },
        );

        if let Some(printer) = changed {
            info!(printer_id = %printer.id, branch_id = %printer.branch_id, "printer registered");
            self.inner
                .gateway
                .broadcast_status(FleetEvent::StatusDelta(Arc::clone(&printer)));
            return Ok(printer);
        }
        store.get(&printer_id).ok_or(CoreError::PrinterNotFound { printer_id })
    }

    /// Run a registry ops command.
    pub fn registry_ops(&self, command: RegistryCommand) -> OpsResponse {
        self.inner.registry.handle(command)
    }

    /// Run one alert pass now, outside the periodic schedule.
    pub fn evaluate_alerts(&self) -> AlertEvaluation {
        run_alert_pass(&self.inner.alerts, &self.inner.gateway)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Evaluate alerts, apply the status corrections they imply, and tell
/// observers about all of it.
fn run_alert_pass(alerts: &AlertEngine, gateway: &Gateway) -> AlertEvaluation {
    let evaluation = alerts.evaluate(&gateway.store().snapshot());

    for (printer_id, status) in &evaluation.status_changes {
        let status = *status;
        if let Some(updated) = gateway.store().update(printer_id, |p| p.status = status) {
            gateway.broadcast_status(FleetEvent::StatusDelta(updated));
        }
    }
    for alert in &evaluation.raised {
        gateway.broadcast_status(FleetEvent::AlertRaised(alert.clone()));
    }
    for alert in &evaluation.cleared {
        gateway.broadcast_status(FleetEvent::AlertCleared(alert.clone()));
    }
    evaluation
}
