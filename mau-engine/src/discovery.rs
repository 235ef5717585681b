//! Local network discovery over mDNS.
//!
//! A serving account registers an instance of [`SERVICE_TYPE`] named after its
//! fingerprint, carrying the fingerprint again as a TXT property. Clients
//! browse the service type and pick the instance whose property matches.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, trace, warn};

use mau_core::fingerprint::Fingerprint;

pub const SERVICE_TYPE: &str = "_mau._udp.local.";
const FINGERPRINT_PROPERTY: &str = "fingerprint";

/// Shuts the daemon down when dropped.
struct Daemon(ServiceDaemon);

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.0.shutdown() {
            debug!(error = %e, "mDNS daemon already stopped");
        }
    }
}

/// Keeps an account advertised on the local network until dropped.
pub struct Advertiser {
    daemon: Daemon,
    fullname: String,
}

impl Advertiser {
    pub fn register(fingerprint: &Fingerprint, port: u16) -> Result<Self> {
        let daemon = Daemon(ServiceDaemon::new().context("failed to start mDNS daemon")?);
        let instance = fingerprint.to_string();
        let host = format!("{instance}.local.");
        let properties = HashMap::from([(FINGERPRINT_PROPERTY.to_string(), instance.clone())]);

        let service = ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, properties)
            .context("invalid mDNS service description")?
            .enable_addr_auto();
        let fullname = service.get_fullname().to_string();
        daemon
            .0
            .register(service)
            .context("failed to register mDNS service")?;

        info!(fingerprint = %fingerprint, port, "Advertising on the local network");
        Ok(Self { daemon, fullname })
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        match self.daemon.0.unregister(&self.fullname) {
            Ok(status) => {
                let _ = status.recv_timeout(Duration::from_secs(1));
            }
            Err(e) => warn!(error = %e, "Failed to unregister mDNS service"),
        }
    }
}

/// Browses the local network for `fingerprint` for at most `timeout`.
///
/// Returns the first matching instance's address, preferring IPv4.
pub async fn discover(fingerprint: Fingerprint, timeout: Duration) -> Result<Option<SocketAddr>> {
    tokio::task::spawn_blocking(move || discover_blocking(&fingerprint, timeout))
        .await
        .context("mDNS browse task failed")?
}

fn discover_blocking(fingerprint: &Fingerprint, timeout: Duration) -> Result<Option<SocketAddr>> {
    let daemon = Daemon(ServiceDaemon::new().context("failed to start mDNS daemon")?);
    let events = daemon
        .0
        .browse(SERVICE_TYPE)
        .context("failed to browse for mDNS services")?;
    let deadline = Instant::now() + timeout;
    let wanted = fingerprint.to_string();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(fingerprint = %fingerprint, "No mDNS answer before the timeout");
            return Ok(None);
        }
        match events.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(service)) => {
                if service.get_property_val_str(FINGERPRINT_PROPERTY) != Some(wanted.as_str()) {
                    trace!(service = service.get_fullname(), "Ignoring other mDNS instance");
                    continue;
                }
                if let Some(ip) = pick_address(service.get_addresses().iter().copied()) {
                    let addr = SocketAddr::new(ip, service.get_port());
                    debug!(fingerprint = %fingerprint, addr = %addr, "Resolved over mDNS");
                    let _ = daemon.0.stop_browse(SERVICE_TYPE);
                    return Ok(Some(addr));
                }
            }
            Ok(other) => trace!(event = ?other, "mDNS event"),
            Err(_) => return Ok(None),
        }
    }
}

fn pick_address(addresses: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for ip in addresses {
        match ip {
            IpAddr::V4(_) => return Some(ip),
            IpAddr::V6(v6) if fallback.is_none() && !v6.is_loopback() => fallback = Some(ip),
            IpAddr::V6(_) => {}
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn given_mixed_families_when_picking_then_ipv4_preferred() {
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 12));
        assert_eq!(pick_address([v6, v4].into_iter()), Some(v4));
    }

    #[test]
    fn given_only_ipv6_when_picking_then_ipv6_returned() {
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7));
        assert_eq!(pick_address([v6].into_iter()), Some(v6));
        assert_eq!(pick_address(std::iter::empty()), None);
    }
}
