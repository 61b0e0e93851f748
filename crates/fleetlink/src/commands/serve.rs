//! `fleetlink serve`: run the gateway until interrupted.

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleetlink_config::Config;
use fleetlink_core::{Fleet, FleetEvent};

use crate::cli::ServeArgs;
use crate::commands::shutdown_signal;
use crate::error::CliError;

pub async fn handle(args: &ServeArgs, mut config: Config) -> Result<(), CliError> {
    apply_overrides(args, &mut config);
    let fleet_config = config.to_fleet_config()?;
    let addr = config.bind_addr()?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| CliError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    let fleet = Fleet::new(fleet_config)?;
    let local = fleet.start(listener)?;
    info!(
        addr = %local,
        service = %fleet.config().service.name,
        mdns = fleet.config().service.mdns,
        "gateway listening"
    );

    tokio::select! {
        () = shutdown_signal() => info!("shutdown requested"),
        () = log_events(fleet.events()) => warn!("event stream closed"),
    }

    fleet.stop().await;
    info!("gateway stopped");
    Ok(())
}

fn apply_overrides(args: &ServeArgs, config: &mut Config) {
    if let Some(bind) = &args.bind {
        config.server.bind.clone_from(bind);
    }
    if let Some(name) = &args.name {
        config.service.name.clone_from(name);
    }
    if args.no_mdns {
        config.service.mdns = false;
    }
}

/// Mirror noteworthy fleet events into the log.
async fn log_events(mut events: broadcast::Receiver<FleetEvent>) {
    loop {
        match events.recv().await {
            Ok(FleetEvent::AlertRaised(alert)) => warn!(
                printer = %alert.printer_id,
                kind = %alert.kind,
                severity = %alert.severity,
                "{}",
                alert.message
            ),
            Ok(FleetEvent::AlertCleared(alert)) => {
                info!(printer = %alert.printer_id, kind = %alert.kind, "alert cleared");
            }
            Ok(FleetEvent::AgentPresence(p)) => info!(
                company = %p.company_id,
                branch = %p.branch_id,
                connected = p.connected,
                agents = p.agents_in_branch,
                "agent presence changed"
            ),
            Ok(FleetEvent::Analytics(s)) => debug!(
                printers = s.total_printers,
                online = s.online,
                agents = s.agents_connected,
                open_circuits = s.open_circuits,
                pending = s.pending_requests,
                "fleet analytics"
            ),
            Ok(other) => debug!(kind = other.kind(), "fleet event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let mut config = Config::default();
        let args = ServeArgs {
            bind: Some("127.0.0.1:9999".into()),
            no_mdns: true,
            name: Some("edge-1".into()),
        };
        apply_overrides(&args, &mut config);
        assert_eq!(config.server.bind, "127.0.0.1:9999");
        assert_eq!(config.service.name, "edge-1");
        assert!(!config.service.mdns);
    }

    #[test]
    fn absent_flags_keep_config() {
        let mut config = Config::default();
        let args = ServeArgs {
            bind: None,
            no_mdns: false,
            name: None,
        };
        apply_overrides(&args, &mut config);
        assert_eq!(config, Config::default());
    }
}
