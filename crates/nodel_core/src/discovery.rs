//! Discovery registry: the current set of advertised nodes.
//!
//! A [`DiscoverySource`] (mDNS or anything else) feeds sightings and expiries
//! into the registry. The registry keys records by reduced node name, expires
//! records that stop being refreshed, and tells subscribers about every
//! membership change.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handlers::Handlers;
use crate::names::NodeName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub name: NodeName,
    pub address: String,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Raw input from a discovery source. `at` is when the source saw the
/// advertisement, not when the registry gets to apply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Seen {
        name: String,
        address: String,
        at: Instant,
    },
    Expired {
        name: String,
    },
}

impl SourceEvent {
    /// A sighting stamped now.
    pub fn seen(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::Seen {
            name: name.into(),
            address: address.into(),
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Added(AdvertisementRecord),
    /// Already known node re-advertised from a different address.
    Moved(AdvertisementRecord),
    Removed(AdvertisementRecord),
}

impl MembershipChange {
    pub fn record(&self) -> &AdvertisementRecord {
        match self {
            Self::Added(r) | Self::Moved(r) | Self::Removed(r) => r,
        }
    }
}

/// The physical discovery layer. Packet formats and timing live behind this
/// trait; the core only consumes the event stream and asks for local nodes
/// to be advertised or withdrawn.
pub trait DiscoverySource: Send + Sync {
    /// Start browsing. Events arrive on the returned channel until shutdown.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SourceEvent>>;

    /// Rebind to a specific interface, or to all interfaces with `None`.
    fn set_interface(&self, interface: Option<IpAddr>) -> Result<()>;

    fn advertise(&self, node: &NodeName, port: u16) -> Result<()>;

    fn withdraw(&self, node: &NodeName);

    fn shutdown(&self);
}

pub type MembershipListener = dyn Fn(&MembershipChange) + Send + Sync;

pub struct DiscoveryRegistry {
    records: RwLock<HashMap<NodeName, AdvertisementRecord>>,
    listeners: Handlers<MembershipListener>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            listeners: Handlers::new(),
        }
    }

    /// Point-in-time snapshot, ordered by reduced name.
    pub fn list(&self) -> Vec<AdvertisementRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn lookup(&self, name: &str) -> Option<AdvertisementRecord> {
        self.records.read().get(&NodeName::new(name)).cloned()
    }

    /// Records whose display name matches the wildcard filter, ordered by
    /// reduced name.
    pub fn enumerate(&self, filter: &str) -> Vec<AdvertisementRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.name.matches(filter))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn subscribe(&self, listener: Arc<MembershipListener>) {
        self.listeners.add(listener);
    }

    pub fn unsubscribe(&self, listener: &Arc<MembershipListener>) {
        self.listeners.remove(listener);
    }

    /// Apply one source event. Malformed input is logged and dropped.
    pub fn apply(&self, event: SourceEvent) -> Option<MembershipChange> {
        match event {
            SourceEvent::Seen { name, address, at } => self.observe_at(&name, &address, at),
            SourceEvent::Expired { name } => self.expire(&name),
        }
    }

    /// Insert a new record or refresh `last_seen` on an existing one.
    pub fn observe(&self, name: &str, address: &str) -> Option<MembershipChange> {
        self.observe_at(name, address, Instant::now())
    }

    /// As [`observe`](Self::observe), for a sighting made at `at`. An older
    /// sighting never moves `last_seen` backwards.
    pub fn observe_at(&self, name: &str, address: &str, at: Instant) -> Option<MembershipChange> {
        let name = NodeName::new(name);
        if name.is_empty() {
            warn!("discovery: ignoring sighting with unusable name {:?}", name.original());
            return None;
        }
        let address = address.trim();
        if address.is_empty() {
            warn!("discovery: ignoring sighting of '{name}' without an address");
            return None;
        }

        let change = {
            let mut records = self.records.write();
            match records.get_mut(&name) {
                Some(record) => {
                    record.last_seen = record.last_seen.max(at);
                    if record.address == address {
                        None
                    } else {
                        record.address = address.to_string();
                        Some(MembershipChange::Moved(record.clone()))
                    }
                }
                None => {
                    let record = AdvertisementRecord {
                        name: name.clone(),
                        address: address.to_string(),
                        first_seen: at,
                        last_seen: at,
                    };
                    records.insert(name, record.clone());
                    Some(MembershipChange::Added(record))
                }
            }
        };

        if let Some(change) = &change {
            let record = change.record();
            match change {
                MembershipChange::Added(_) => {
                    info!("discovery: node '{}' appeared at {}", record.name, record.address)
                }
                _ => info!("discovery: node '{}' moved to {}", record.name, record.address),
            }
            self.notify(change);
        }
        change
    }

    pub fn expire(&self, name: &str) -> Option<MembershipChange> {
        let removed = self.records.write().remove(&NodeName::new(name));
        let change = removed.map(MembershipChange::Removed);
        if let Some(change) = &change {
            info!("discovery: node '{}' expired", change.record().name);
            self.notify(change);
        }
        change
    }

    /// Remove every record not refreshed within `ttl`.
    pub fn sweep(&self, ttl: Duration) -> Vec<MembershipChange> {
        self.sweep_at(Instant::now(), ttl)
    }

    pub fn sweep_at(&self, now: Instant, ttl: Duration) -> Vec<MembershipChange> {
        let changes: Vec<MembershipChange> = {
            let mut records = self.records.write();
            let stale: Vec<NodeName> = records
                .values()
                .filter(|r| now.saturating_duration_since(r.last_seen) > ttl)
                .map(|r| r.name.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|name| records.remove(&name))
                .map(MembershipChange::Removed)
                .collect()
        };

        for change in &changes {
            info!("discovery: node '{}' timed out", change.record().name);
            self.notify(change);
        }
        changes
    }

    fn notify(&self, change: &MembershipChange) {
        for listener in self.listeners.snapshot() {
            listener(change);
        }
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process discovery source driven by hand. Used by tests and by hosts
/// that learn about nodes some other way.
pub struct ChannelSource {
    tx: mpsc::UnboundedSender<SourceEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
    advertised: Mutex<BTreeMap<NodeName, u16>>,
    interface: Mutex<Option<IpAddr>>,
    shut_down: AtomicBool,
}

impl ChannelSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            advertised: Mutex::new(BTreeMap::new()),
            interface: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns false once the subscriber has gone away.
    pub fn inject(&self, event: SourceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn seen(&self, name: &str, address: &str) -> bool {
        self.inject(SourceEvent::seen(name, address))
    }

    pub fn expired(&self, name: &str) -> bool {
        self.inject(SourceEvent::Expired {
            name: name.to_string(),
        })
    }

    pub fn advertised(&self) -> Vec<(NodeName, u16)> {
        self.advertised
            .lock()
            .iter()
            .map(|(name, port)| (name.clone(), *port))
            .collect()
    }

    pub fn interface(&self) -> Option<IpAddr> {
        *self.interface.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoverySource for ChannelSource {
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SourceEvent>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("channel source already has a subscriber"))
    }

    fn set_interface(&self, interface: Option<IpAddr>) -> Result<()> {
        *self.interface.lock() = interface;
        Ok(())
    }

    fn advertise(&self, node: &NodeName, port: u16) -> Result<()> {
        debug!("channel source: advertising '{node}' on port {port}");
        self.advertised.lock().insert(node.clone(), port);
        Ok(())
    }

    fn withdraw(&self, node: &NodeName) {
        self.advertised.lock().remove(node);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.advertised.lock().clear();
    }
}
