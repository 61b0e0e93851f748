// ── Multicast DNS advertisement ──
//
// The registry announces the gateway on the local segment so agents can
// find it without a configured address. Failures here are reported to
// the caller, which logs them and carries on.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info};

use crate::error::CoreError;

/// DNS-SD service type used when none is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "_fleetlink._tcp.local.";

/// What to announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Instance label, e.g. `gateway-eu1`.
    pub instance: String,
    /// Fully qualified DNS-SD type ending in `.local.`.
    pub service_type: String,
    pub port: u16,
    /// TXT record entries (version, capabilities, ...).
    pub properties: HashMap<String, String>,
}

/// Announces and withdraws a service on the local network.
pub trait Advertiser: Send + Sync + 'static {
    fn advertise(&self, ad: &Advertisement) -> Result<(), CoreError>;
    fn withdraw(&self);
}

/// Advertiser that does nothing, for tests and `--no-mdns`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdvertiser;

impl Advertiser for NoopAdvertiser {
    fn advertise(&self, ad: &Advertisement) -> Result<(), CoreError> {
        debug!(instance = %ad.instance, "mDNS advertisement disabled");
        Ok(())
    }

    fn withdraw(&self) {}
}

struct Registration {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Advertiser backed by an `mdns-sd` responder daemon.
#[derive(Default)]
pub struct MdnsAdvertiser {
    active: ArcSwapOption<Registration>,
}

impl MdnsAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_advertising(&self) -> bool {
        self.active.load().is_some()
    }
}

fn advertise_error(err: &mdns_sd::Error) -> CoreError {
    CoreError::Advertise {
        reason: err.to_string(),
    }
}

impl Advertiser for MdnsAdvertiser {
    fn advertise(&self, ad: &Advertisement) -> Result<(), CoreError> {
        self.withdraw();

        let daemon = ServiceDaemon::new().map_err(|e| advertise_error(&e))?;
        let host = format!("{}.local.", ad.instance);
        let info = ServiceInfo::new(
            &ad.service_type,
            &ad.instance,
            &host,
            "",
            ad.port,
            ad.properties.clone(),
        )
        .map_err(|e| advertise_error(&e))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_owned();
        if let Err(e) = daemon.register(info) {
            let _ = daemon.shutdown();
            return Err(advertise_error(&e));
        }

        info!(service = %fullname, port = ad.port, "advertising over mDNS");
        self.active
            .store(Some(Arc::new(Registration { daemon, fullname })));
        Ok(())
    }

    fn withdraw(&self) {
        let Some(previous) = self.active.swap(None) else {
            return;
        };
        if let Err(e) = previous.daemon.unregister(&previous.fullname) {
            debug!(error = %e, "mDNS unregister failed");
        }
        if let Err(e) = previous.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
        info!(service = %previous.fullname, "mDNS advertisement withdrawn");
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdraw_without_advertisement_is_a_no_op() {
        let advertiser = MdnsAdvertiser::new();
        advertiser.withdraw();
        assert!(!advertiser.is_advertising());
    }

    #[test]
    fn noop_always_succeeds() {
        let ad = Advertisement {
            instance: "gw".into(),
            service_type: DEFAULT_SERVICE_TYPE.into(),
            port: 7420,
            properties: HashMap::new(),
        };
        assert!(NoopAdvertiser.advertise(&ad).is_ok());
    }
}
