//! mDNS discovery source using mdns-sd.
//!
//! Every locally hosted node is registered as a `_nodel._tcp.local.` service
//! carrying its display name and the framework version in TXT properties.
//! A browse thread turns resolved and removed services into [`SourceEvent`]s.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nodel_core::discovery::{DiscoverySource, SourceEvent};
use nodel_core::NodeName;

pub const SERVICE_TYPE: &str = "_nodel._tcp.local.";
const PROP_NODE: &str = "node";
const PROP_VERSION: &str = "version";
const BROWSE_POLL: Duration = Duration::from_millis(500);

/// A resolved service reduced to what discovery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub fullname: String,
    pub name: String,
    pub address: String,
}

/// Node name from the `node` TXT property, falling back to the instance
/// part of the full service name. IPv4 addresses are preferred.
pub fn sighting_from(info: &ServiceInfo) -> Option<Sighting> {
    let fullname = info.get_fullname().to_string();
    let name = info
        .get_property_val_str(PROP_NODE)
        .map(str::to_string)
        .filter(|n| !n.trim().is_empty())
        .or_else(|| instance_name(&fullname))?;

    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .filter(|a| a.is_ipv4())
        .min()
        .or_else(|| addresses.iter().min())?;

    Some(Sighting {
        fullname,
        name,
        address: address.to_string(),
    })
}

fn instance_name(fullname: &str) -> Option<String> {
    let suffix = format!(".{SERVICE_TYPE}");
    fullname
        .strip_suffix(&suffix)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "nodel-host".into())
}

pub struct MdnsSource {
    daemon: ServiceDaemon,
    host: String,
    interface: Mutex<Option<IpAddr>>,
    /// Local nodes currently registered, by full service name.
    registered: Mutex<HashMap<NodeName, String>>,
    /// Remote full service names seen, for mapping removals back to nodes.
    resolved: Arc<Mutex<HashMap<String, String>>>,
    stop: Arc<AtomicBool>,
    browser: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsSource {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| anyhow!("create mDNS daemon: {e}"))?;
        Ok(Self {
            daemon,
            host: local_hostname(),
            interface: Mutex::new(None),
            registered: Mutex::new(HashMap::new()),
            resolved: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            browser: Mutex::new(None),
        })
    }

    fn service_info(&self, node: &NodeName, port: u16) -> Result<ServiceInfo> {
        let instance = format!("{}-{}", node.reduced(), self.host);
        let properties = [
            (PROP_NODE.to_string(), node.original().to_string()),
            (PROP_VERSION.to_string(), nodel_core::VERSION.to_string()),
        ];
        let address = self
            .interface
            .lock()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{}.local.", self.host),
            address.as_str(),
            port,
            &properties[..],
        )
        .context("create mDNS service info")?;

        Ok(if address.is_empty() {
            info.enable_addr_auto()
        } else {
            info
        })
    }
}

fn handle_event(
    event: ServiceEvent,
    resolved: &Mutex<HashMap<String, String>>,
    tx: &mpsc::UnboundedSender<SourceEvent>,
) -> bool {
    let event = match event {
        ServiceEvent::ServiceResolved(info) => match sighting_from(&info) {
            Some(s) => {
                resolved.lock().insert(s.fullname, s.name.clone());
                SourceEvent::seen(s.name, s.address)
            }
            None => {
                warn!("mDNS: ignoring unusable service {}", info.get_fullname());
                return true;
            }
        },
        ServiceEvent::ServiceRemoved(_ty, fullname) => match resolved.lock().remove(&fullname) {
            Some(name) => SourceEvent::Expired { name },
            None => {
                debug!("mDNS: removal of unknown service {fullname}");
                return true;
            }
        },
        ServiceEvent::SearchStarted(_) => {
            debug!("mDNS: browse started");
            return true;
        }
        _ => return true,
    };
    tx.send(event).is_ok()
}

impl DiscoverySource for MdnsSource {
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SourceEvent>> {
        let mut browser = self.browser.lock();
        if browser.is_some() {
            return Err(anyhow!("mDNS source already has a subscriber"));
        }

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| anyhow!("start mDNS browse: {e}"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let resolved = self.resolved.clone();
        let stop = self.stop.clone();

        let handle = std::thread::Builder::new()
            .name("nodel-mdns-browse".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match receiver.recv_timeout(BROWSE_POLL) {
                        Ok(event) => {
                            if !handle_event(event, &resolved, &tx) {
                                break;
                            }
                        }
                        Err(e) if receiver.is_disconnected() => {
                            debug!("mDNS browse channel closed: {e}");
                            break;
                        }
                        Err(_) => {}
                    }
                }
                debug!("mDNS browse stopped");
            })
            .context("spawn mDNS browse thread")?;

        *browser = Some(handle);
        info!("mDNS: browsing for {SERVICE_TYPE}");
        Ok(rx)
    }

    fn set_interface(&self, interface: Option<IpAddr>) -> Result<()> {
        match interface {
            Some(addr) => {
                self.daemon
                    .disable_interface(IfKind::All)
                    .map_err(|e| anyhow!("disable mDNS interfaces: {e}"))?;
                self.daemon
                    .enable_interface(IfKind::Addr(addr))
                    .map_err(|e| anyhow!("enable mDNS interface {addr}: {e}"))?;
            }
            None => {
                self.daemon
                    .enable_interface(IfKind::All)
                    .map_err(|e| anyhow!("enable all mDNS interfaces: {e}"))?;
            }
        }
        *self.interface.lock() = interface;
        Ok(())
    }

    fn advertise(&self, node: &NodeName, port: u16) -> Result<()> {
        let service = self.service_info(node, port)?;
        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| anyhow!("register mDNS service for '{node}': {e}"))?;
        self.registered.lock().insert(node.clone(), fullname);
        info!("mDNS: advertising '{node}' on port {port}");
        Ok(())
    }

    fn withdraw(&self, node: &NodeName) {
        let Some(fullname) = self.registered.lock().remove(node) else {
            return;
        };
        match self.daemon.unregister(&fullname) {
            Ok(_) => info!("mDNS: withdrew '{node}'"),
            Err(e) => warn!("mDNS: failed to withdraw '{node}': {e}"),
        }
    }

    fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let registered: Vec<NodeName> = self.registered.lock().keys().cloned().collect();
        for node in &registered {
            self.withdraw(node);
        }
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("mDNS: stop browse: {e}");
        }
        if let Some(handle) = self.browser.lock().take() {
            if handle.join().is_err() {
                warn!("mDNS browse thread panicked");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {e}");
        }
    }
}

impl Drop for MdnsSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(instance: &str, ip: &str, node: Option<&str>) -> ServiceInfo {
        let mut properties = vec![(PROP_VERSION.to_string(), "0.1.0".to_string())];
        if let Some(node) = node {
            properties.push((PROP_NODE.to_string(), node.to_string()));
        }
        ServiceInfo::new(SERVICE_TYPE, instance, "box.local.", ip, 8085, &properties[..]).unwrap()
    }

    #[test]
    fn service_type_is_valid() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.contains("._tcp."));
    }

    #[test]
    fn sighting_uses_node_property() {
        let s = sighting_from(&info("kitchenlight-box", "10.0.0.5", Some("Kitchen Light"))).unwrap();
        assert_eq!(s.name, "Kitchen Light");
        assert_eq!(s.address, "10.0.0.5");
        assert_eq!(s.fullname, format!("kitchenlight-box.{SERVICE_TYPE}"));
    }

    #[test]
    fn sighting_falls_back_to_instance_name() {
        let s = sighting_from(&info("Hall Display", "10.0.0.9", None)).unwrap();
        assert_eq!(s.name, "Hall Display");
    }

    #[test]
    fn sighting_prefers_ipv4() {
        let s = sighting_from(&info("amp", "fe80::1,10.0.0.7", Some("Amp"))).unwrap();
        assert_eq!(s.address, "10.0.0.7");
    }

    #[test]
    fn sighting_without_address_is_dropped() {
        assert!(sighting_from(&info("amp", "", Some("Amp"))).is_none());
    }

    #[test]
    fn events_map_to_source_events() {
        let resolved = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let found = info("amp-box", "10.0.0.5", Some("Amp"));
        let fullname = found.get_fullname().to_string();
        assert!(handle_event(ServiceEvent::ServiceResolved(found), &resolved, &tx));
        assert!(handle_event(
            ServiceEvent::ServiceRemoved(SERVICE_TYPE.into(), fullname),
            &resolved,
            &tx
        ));
        assert!(handle_event(
            ServiceEvent::ServiceRemoved(SERVICE_TYPE.into(), "never-seen".into()),
            &resolved,
            &tx
        ));

        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceEvent::Seen { ref name, ref address, .. } if name == "Amp" && address == "10.0.0.5"
        ));
        assert_eq!(rx.try_recv().unwrap(), SourceEvent::Expired { name: "Amp".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_subscriber_stops_browsing() {
        let resolved = Mutex::new(HashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let found = info("amp-box", "10.0.0.5", Some("Amp"));
        assert!(!handle_event(ServiceEvent::ServiceResolved(found), &resolved, &tx));
    }
}
