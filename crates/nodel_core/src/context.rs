//! The process-wide context: one explicit object owning discovery, endpoint
//! resolution, bindings and the fault channel, with `init` and `shutdown`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::binding::{Advertiser, BindingRegistry};
use crate::discovery::{AdvertisementRecord, DiscoveryRegistry, DiscoverySource, SourceEvent};
use crate::fault::{FaultChannel, FaultHandler};
use crate::names::NodeName;
use crate::resolver::{EndpointResolver, HttpEndpoint, NodeUrl, DEFAULT_HTTP_PORT, DEFAULT_HTTP_SUFFIX};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodelSettings {
    pub http_port: u16,
    pub http_suffix: String,
    pub interface: Option<IpAddr>,
    pub disable_server_advertisements: bool,
    pub advertisement_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for NodelSettings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            http_suffix: DEFAULT_HTTP_SUFFIX.to_string(),
            interface: None,
            disable_server_advertisements: false,
            advertisement_ttl_secs: 180,
            sweep_interval_secs: 15,
        }
    }
}

/// Advertises local owners through the discovery source at the current
/// HTTP port, unless advertisements are disabled. Only called with the
/// binding registry's local table locked, which also guards the flag.
struct SourceAdvertiser {
    source: Arc<dyn DiscoverySource>,
    endpoint: Arc<RwLock<HttpEndpoint>>,
    disabled: Arc<AtomicBool>,
}

impl Advertiser for SourceAdvertiser {
    fn advertise(&self, node: &NodeName) {
        if self.disabled.load(Ordering::Acquire) {
            debug!("server advertisements disabled, not advertising '{node}'");
            return;
        }
        let port = self.endpoint.read().port;
        if let Err(e) = self.source.advertise(node, port) {
            warn!("failed to advertise '{node}': {e:#}");
        }
    }

    fn withdraw(&self, node: &NodeName) {
        self.source.withdraw(node);
    }
}

pub struct NodelContext {
    source: Arc<dyn DiscoverySource>,
    discovery: Arc<DiscoveryRegistry>,
    resolver: EndpointResolver,
    bindings: Arc<BindingRegistry>,
    faults: Arc<FaultChannel>,
    advertiser: Arc<SourceAdvertiser>,
    interface: RwLock<Option<IpAddr>>,
    advertisements_disabled: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl NodelContext {
    /// Builds the context and starts the ingestion and TTL sweep tasks on
    /// the current tokio runtime. Wiring re-evaluation and status callbacks
    /// run on a separate `nodel-wiring` thread.
    pub fn init(
        settings: NodelSettings,
        source: Arc<dyn DiscoverySource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("nodel context must be created inside a tokio runtime")?;

        if settings.interface.is_some() {
            source
                .set_interface(settings.interface)
                .context("bind discovery source to interface")?;
        }
        let events = source.subscribe().context("subscribe to discovery source")?;

        let discovery = Arc::new(DiscoveryRegistry::new());
        let endpoint = Arc::new(RwLock::new(HttpEndpoint {
            port: settings.http_port,
            suffix: settings.http_suffix.clone(),
        }));
        let resolver = EndpointResolver::new(discovery.clone(), endpoint.clone());
        let faults = Arc::new(FaultChannel::new());
        let bindings = BindingRegistry::with_wiring_thread(resolver.clone(), transport, faults.clone())?;

        let advertisements_disabled = Arc::new(AtomicBool::new(settings.disable_server_advertisements));
        let advertiser = Arc::new(SourceAdvertiser {
            source: source.clone(),
            endpoint,
            disabled: advertisements_disabled.clone(),
        });
        let shared: Arc<dyn Advertiser> = advertiser.clone();
        bindings.set_advertiser(Some(shared));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        runtime.spawn(ingest_loop(discovery.clone(), events, shutdown_rx.clone()));

        let ttl = Duration::from_secs(settings.advertisement_ttl_secs);
        let every = Duration::from_secs(settings.sweep_interval_secs.max(1));
        runtime.spawn(sweep_loop(discovery.clone(), ttl, every, shutdown_rx));

        info!(
            "nodel {} context ready (http port {}, suffix '{}')",
            crate::VERSION,
            settings.http_port,
            settings.http_suffix
        );

        Ok(Arc::new(Self {
            source,
            discovery,
            resolver,
            bindings,
            faults,
            advertiser,
            interface: RwLock::new(settings.interface),
            advertisements_disabled,
            shutdown_tx,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    pub fn discovery(&self) -> &Arc<DiscoveryRegistry> {
        &self.discovery
    }

    pub fn faults(&self) -> &Arc<FaultChannel> {
        &self.faults
    }

    pub fn get_all_nodes(&self) -> Vec<AdvertisementRecord> {
        self.discovery.list()
    }

    /// `filter` is a case-insensitive substring of the display name, not a
    /// wildcard filter.
    pub fn get_node_urls(&self, filter: Option<&str>) -> Vec<NodeUrl> {
        self.resolver.node_urls(filter)
    }

    pub fn get_interface_to_use(&self) -> Option<IpAddr> {
        *self.interface.read()
    }

    /// Rebinds the live discovery source.
    pub fn set_interface_to_use(&self, interface: Option<IpAddr>) -> Result<()> {
        self.source
            .set_interface(interface)
            .context("rebind discovery source")?;
        *self.interface.write() = interface;
        match interface {
            Some(addr) => info!("discovery bound to interface {addr}"),
            None => info!("discovery bound to all interfaces"),
        }
        Ok(())
    }

    pub fn get_http_port(&self) -> u16 {
        self.resolver.endpoint().port
    }

    /// Changes the port used for every resolution. Local owners are
    /// re-advertised on the new port and remote bindings re-resolved.
    pub fn set_http_port(&self, port: u16) {
        if self.get_http_port() == port {
            return;
        }
        self.resolver.set_port(port);
        info!("http port set to {port}");
        self.bindings.with_local_owners(|owners| {
            for owner in owners {
                self.advertiser.advertise(owner);
            }
        });
        self.bindings.rewire_all();
    }

    pub fn get_http_suffix(&self) -> String {
        self.resolver.endpoint().suffix
    }

    pub fn set_http_suffix(&self, suffix: impl Into<String>) {
        let suffix = suffix.into();
        info!("http suffix set to '{suffix}'");
        self.resolver.set_suffix(suffix);
        self.bindings.rewire_all();
    }

    pub fn get_disable_server_advertisements(&self) -> bool {
        self.advertisements_disabled.load(Ordering::Acquire)
    }

    /// The flag and the advertisements change together under the local
    /// table lock.
    pub fn set_disable_server_advertisements(&self, disabled: bool) {
        self.bindings.with_local_owners(|owners| {
            if self.advertisements_disabled.swap(disabled, Ordering::AcqRel) == disabled {
                return;
            }
            if disabled {
                info!("server advertisements disabled, withdrawing {} nodes", owners.len());
                for owner in owners {
                    self.advertiser.withdraw(owner);
                }
            } else {
                info!("server advertisements enabled, advertising {} nodes", owners.len());
                for owner in owners {
                    self.advertiser.advertise(owner);
                }
            }
        });
    }

    pub fn attach_name_registration_fault_handler(&self, handler: Arc<FaultHandler>) {
        self.faults.attach(handler);
    }

    pub fn detach_name_registration_fault_handler(&self, handler: &Arc<FaultHandler>) {
        self.faults.detach(handler);
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the background tasks and releases every binding. Idempotent;
    /// the context cannot be restarted.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.bindings.shutdown();
        self.bindings.set_advertiser(None);
        self.source.shutdown();
        self.faults.clear();
        info!("nodel context shut down");
    }
}

impl Drop for NodelContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn ingest_loop(
    discovery: Arc<DiscoveryRegistry>,
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    discovery.apply(event);
                }
                None => {
                    debug!("discovery source closed its event stream");
                    break;
                }
            },
        }
    }
    debug!("discovery ingestion stopped");
}

async fn sweep_loop(
    discovery: Arc<DiscoveryRegistry>,
    ttl: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let expired = discovery.sweep(ttl);
                if !expired.is_empty() {
                    debug!("sweep expired {} nodes", expired.len());
                }
            }
        }
    }
}
