//! Action and event bindings.
//!
//! Local bindings are what this process exposes: actions other nodes can
//! call and events it emits. Remote bindings are what it consumes from other
//! nodes. A remote binding is `Unbound` until the discovery registry holds a
//! node matching its target filter, at which point it becomes `Wired` to that
//! node's endpoint; it drops back to `Unbound` when the node goes away.
//!
//! Registry locks are only held for bookkeeping. Every user callback runs
//! with no lock held, so callbacks may call back into the registry.
//! Status changes for a binding are queued and delivered in order by
//! whichever thread is already dispatching for it. Once `unregister_remote`
//! returns, no callback for that binding starts, and any that was running
//! has finished unless the caller is itself inside a callback.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::discovery::{MembershipChange, MembershipListener};
use crate::error::{NodelError, Result};
use crate::fault::FaultChannel;
use crate::names::{reduce_filter, NodeName, WILDCARD};
use crate::resolver::{EndpointResolver, NodeUrl};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Action,
    Event,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action => write!(f, "action"),
            Self::Event => write!(f, "event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingState {
    Unbound,
    Wired,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => write!(f, "Unbound"),
            Self::Wired => write!(f, "Wired"),
        }
    }
}

pub type ActionHandler = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;
pub type EventMonitor = Arc<dyn Fn(&Value) + Send + Sync>;
pub type InvokeMonitor = Arc<dyn Fn(&Value, BindingState) + Send + Sync>;
pub type WiredStatusHandler = Arc<dyn Fn(BindingState) + Send + Sync>;
pub type ArrivalHandler = Arc<dyn Fn(&NodeName, &Value) + Send + Sync>;

/// Announces local owner nodes to the network. Called with registry locks
/// held, so implementations must not call back into the registry.
pub trait Advertiser: Send + Sync {
    fn advertise(&self, node: &NodeName);
    fn withdraw(&self, node: &NodeName);
}

#[derive(Clone)]
pub enum LocalHandler {
    Action(ActionHandler),
    /// Events carry an optional monitor called on every emission.
    Event(Option<EventMonitor>),
}

impl LocalHandler {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Action(_) => SignalKind::Action,
            Self::Event(_) => SignalKind::Event,
        }
    }
}

pub struct LocalBinding {
    id: u64,
    owner: NodeName,
    signal: NodeName,
    handler: LocalHandler,
}

impl LocalBinding {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &NodeName {
        &self.owner
    }

    pub fn signal(&self) -> &NodeName {
        &self.signal
    }

    pub fn kind(&self) -> SignalKind {
        self.handler.kind()
    }
}

impl fmt::Debug for LocalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBinding")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("signal", &self.signal)
            .field("kind", &self.kind())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct RemoteCallbacks {
    invoke: Option<InvokeMonitor>,
    wired_status: Option<WiredStatusHandler>,
    arrival: Option<ArrivalHandler>,
}

impl RemoteCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every remote action call with the binding's state at the
    /// time of the call, including calls that fail because it is unbound.
    pub fn on_invoke(mut self, f: impl Fn(&Value, BindingState) + Send + Sync + 'static) -> Self {
        self.invoke = Some(Arc::new(f));
        self
    }

    /// Called once per state transition.
    pub fn on_wired_status_changed(
        mut self,
        f: impl Fn(BindingState) + Send + Sync + 'static,
    ) -> Self {
        self.wired_status = Some(Arc::new(f));
        self
    }

    /// Called when a remote event arrives from the wired node.
    pub fn on_arrival(mut self, f: impl Fn(&NodeName, &Value) + Send + Sync + 'static) -> Self {
        self.arrival = Some(Arc::new(f));
        self
    }
}

struct Wiring {
    state: BindingState,
    endpoint: Option<NodeUrl>,
    pending: VecDeque<BindingState>,
    dispatching: bool,
    /// Callbacks for this binding currently executing.
    running: usize,
}

pub struct RemoteBinding {
    id: u64,
    target: String,
    signal: NodeName,
    kind: SignalKind,
    callbacks: RemoteCallbacks,
    wiring: Mutex<Wiring>,
    idle: Condvar,
    closed: AtomicBool,
}

impl RemoteBinding {
    fn new(
        id: u64,
        target: String,
        signal: NodeName,
        kind: SignalKind,
        callbacks: RemoteCallbacks,
    ) -> Self {
        Self {
            id,
            target,
            signal,
            kind,
            callbacks,
            wiring: Mutex::new(Wiring {
                state: BindingState::Unbound,
                endpoint: None,
                pending: VecDeque::new(),
                dispatching: false,
                running: 0,
            }),
            idle: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The node filter as given.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn signal(&self) -> &NodeName {
        &self.signal
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn state(&self) -> BindingState {
        self.wiring.lock().state
    }

    pub fn is_unbound(&self) -> bool {
        self.state() == BindingState::Unbound
    }

    pub fn wired_endpoint(&self) -> Option<NodeUrl> {
        self.wiring.lock().endpoint.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// An empty target or signal never wires.
    fn wireable(&self) -> bool {
        !self.signal.is_empty() && reduce_filter(&self.target).chars().any(|c| c != WILDCARD)
    }

    fn affected_by(&self, node: &NodeName) -> bool {
        node.matches(&self.target)
            || self
                .wiring
                .lock()
                .endpoint
                .as_ref()
                .is_some_and(|e| e.node == *node)
    }

    /// Re-resolve and transition if the outcome differs from the current
    /// state. Resolution happens under the binding's own lock so the last
    /// evaluation always reflects the latest discovery state.
    fn evaluate(&self, resolver: &EndpointResolver) {
        {
            let mut wiring = self.wiring.lock();
            if self.is_closed() {
                return;
            }

            let resolved = if self.wireable() {
                resolver.resolve_all(&self.target, None).into_iter().next()
            } else {
                None
            };

            match resolved {
                Some(endpoint) if wiring.state == BindingState::Wired => {
                    if wiring.endpoint.as_ref() != Some(&endpoint) {
                        debug!(
                            "{} '{}' on '{}' now points at {endpoint}",
                            self.kind, self.signal, self.target
                        );
                        wiring.endpoint = Some(endpoint);
                    }
                }
                Some(endpoint) => {
                    info!(
                        "{} '{}' on '{}' wired to {endpoint}",
                        self.kind, self.signal, self.target
                    );
                    wiring.state = BindingState::Wired;
                    wiring.endpoint = Some(endpoint);
                    wiring.pending.push_back(BindingState::Wired);
                }
                None if wiring.state == BindingState::Wired => {
                    info!(
                        "{} '{}' on '{}' is now unbound",
                        self.kind, self.signal, self.target
                    );
                    wiring.state = BindingState::Unbound;
                    wiring.endpoint = None;
                    wiring.pending.push_back(BindingState::Unbound);
                }
                None => {
                    debug!(
                        "{}",
                        NodelError::ResolutionFailure {
                            filter: self.target.clone()
                        }
                    );
                }
            }
        }
        self.dispatch_pending();
    }

    fn dispatch_pending(&self) {
        {
            let mut wiring = self.wiring.lock();
            if wiring.dispatching || wiring.pending.is_empty() {
                return;
            }
            wiring.dispatching = true;
        }

        loop {
            let next = {
                let mut wiring = self.wiring.lock();
                match wiring.pending.pop_front() {
                    Some(state) if !self.is_closed() => {
                        wiring.running += 1;
                        state
                    }
                    _ => {
                        wiring.pending.clear();
                        wiring.dispatching = false;
                        return;
                    }
                }
            };

            if let Some(handler) = &self.callbacks.wired_status {
                guarded("wired status handler", || handler(next));
            }
            self.leave_callback();
        }
    }

    /// Marks a callback as running unless the binding is closed. Pair with
    /// [`leave_callback`](Self::leave_callback).
    fn enter_callback(&self) -> Option<(BindingState, Option<NodeUrl>)> {
        let mut wiring = self.wiring.lock();
        if self.is_closed() {
            return None;
        }
        wiring.running += 1;
        Some((wiring.state, wiring.endpoint.clone()))
    }

    fn leave_callback(&self) {
        let mut wiring = self.wiring.lock();
        wiring.running -= 1;
        if wiring.running == 0 {
            self.idle.notify_all();
        }
    }

    /// Returns false if already closed. Pending transitions are discarded and
    /// running callbacks are waited for, except when called from inside a
    /// callback, where waiting could deadlock.
    fn close(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        let mut wiring = self.wiring.lock();
        wiring.pending.clear();
        wiring.state = BindingState::Unbound;
        wiring.endpoint = None;
        if !in_callback() {
            while wiring.running > 0 {
                self.idle.wait(&mut wiring);
            }
        }
        !was_closed
    }
}

impl fmt::Debug for RemoteBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBinding")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("signal", &self.signal)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    Local(Arc<LocalBinding>),
    Remote(Arc<RemoteBinding>),
}

impl From<Arc<LocalBinding>> for Binding {
    fn from(binding: Arc<LocalBinding>) -> Self {
        Self::Local(binding)
    }
}

impl From<Arc<RemoteBinding>> for Binding {
    fn from(binding: Arc<RemoteBinding>) -> Self {
        Self::Remote(binding)
    }
}

type LocalKey = (NodeName, NodeName, SignalKind);

pub struct BindingRegistry {
    resolver: EndpointResolver,
    transport: Arc<dyn Transport>,
    faults: Arc<FaultChannel>,
    advertiser: RwLock<Option<Arc<dyn Advertiser>>>,
    local: Mutex<HashMap<LocalKey, Arc<LocalBinding>>>,
    remote: Mutex<Vec<Arc<RemoteBinding>>>,
    listener: Mutex<Option<Arc<MembershipListener>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl BindingRegistry {
    /// Creates the registry and subscribes it to the resolver's discovery
    /// registry.
    ///
    /// Membership changes are re-evaluated on the thread that applies them
    /// to the discovery registry, so status callbacks run on that thread.
    pub fn new(
        resolver: EndpointResolver,
        transport: Arc<dyn Transport>,
        faults: Arc<FaultChannel>,
    ) -> Arc<Self> {
        let registry = Self::detached(resolver, transport, faults);
        let weak = Arc::downgrade(&registry);
        let listener: Arc<MembershipListener> = Arc::new(move |change: &MembershipChange| {
            if let Some(registry) = weak.upgrade() {
                registry.on_membership_change(change);
            }
        });
        registry.listen(listener);
        registry
    }

    /// Like [`new`](Self::new), but membership changes are handed to a
    /// dedicated `nodel-wiring` thread. Slow status callbacks then hold up
    /// later re-evaluations, never the thread feeding discovery.
    pub fn with_wiring_thread(
        resolver: EndpointResolver,
        transport: Arc<dyn Transport>,
        faults: Arc<FaultChannel>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = Self::detached(resolver, transport, faults);
        let (tx, mut rx) = mpsc::unbounded_channel::<MembershipChange>();

        let weak = Arc::downgrade(&registry);
        std::thread::Builder::new()
            .name("nodel-wiring".into())
            .spawn(move || {
                // ends once the listener, and with it the sender, is dropped
                while let Some(change) = rx.blocking_recv() {
                    match weak.upgrade() {
                        Some(registry) => registry.on_membership_change(&change),
                        None => break,
                    }
                }
                debug!("wiring thread stopped");
            })
            .context("spawn wiring thread")?;

        let listener: Arc<MembershipListener> = Arc::new(move |change: &MembershipChange| {
            if tx.send(change.clone()).is_err() {
                debug!("wiring thread gone, dropping membership change");
            }
        });
        registry.listen(listener);
        Ok(registry)
    }

    fn detached(
        resolver: EndpointResolver,
        transport: Arc<dyn Transport>,
        faults: Arc<FaultChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            transport,
            faults,
            advertiser: RwLock::new(None),
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn listen(&self, listener: Arc<MembershipListener>) {
        self.resolver.discovery().subscribe(listener.clone());
        *self.listener.lock() = Some(listener);
    }

    pub fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    pub fn set_advertiser(&self, advertiser: Option<Arc<dyn Advertiser>>) {
        *self.advertiser.write() = advertiser;
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- local (server side) ----

    /// Registers something this process exposes. A second registration for
    /// the same owner, signal and kind is rejected: it returns `None` and is
    /// reported on the fault channel.
    pub fn register_local(
        &self,
        owner: impl Into<NodeName>,
        signal: impl Into<NodeName>,
        handler: LocalHandler,
    ) -> Option<Arc<LocalBinding>> {
        let owner = owner.into();
        let signal = signal.into();
        let kind = handler.kind();

        if self.is_shut_down() {
            warn!("ignoring registration of {kind} '{signal}' on '{owner}' after shutdown");
            return None;
        }

        {
            let mut local = self.local.lock();
            let key = (owner.clone(), signal.clone(), kind);
            if !local.contains_key(&key) {
                let first_for_owner = !local.keys().any(|(o, _, _)| *o == owner);
                let binding = Arc::new(LocalBinding {
                    id: self.next_id(),
                    owner: owner.clone(),
                    signal: signal.clone(),
                    handler,
                });
                local.insert(key, binding.clone());
                if first_for_owner {
                    if let Some(advertiser) = self.advertiser.read().as_ref() {
                        advertiser.advertise(&owner);
                    }
                }
                info!("registered local {kind} '{signal}' on '{owner}'");
                return Some(binding);
            }
        }

        // fault handlers run with no lock held
        let fault = NodelError::DuplicateRegistration {
            node: owner.clone(),
            signal,
            kind,
        };
        warn!("{fault}");
        self.faults.notify(&owner, &fault);
        None
    }

    pub fn register_local_action(
        &self,
        owner: impl Into<NodeName>,
        action: impl Into<NodeName>,
        handler: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Option<Arc<LocalBinding>> {
        self.register_local(owner, action, LocalHandler::Action(Arc::new(handler)))
    }

    pub fn register_local_event(
        &self,
        owner: impl Into<NodeName>,
        event: impl Into<NodeName>,
        monitor: Option<EventMonitor>,
    ) -> Option<Arc<LocalBinding>> {
        self.register_local(owner, event, LocalHandler::Event(monitor))
    }

    pub fn unregister_local(&self, binding: &LocalBinding) {
        let mut local = self.local.lock();
        let key = (binding.owner.clone(), binding.signal.clone(), binding.kind());
        if !local.get(&key).is_some_and(|b| b.id == binding.id) {
            return;
        }
        local.remove(&key);
        let last_for_owner = !local.keys().any(|(o, _, _)| *o == binding.owner);
        if last_for_owner {
            if let Some(advertiser) = self.advertiser.read().as_ref() {
                advertiser.withdraw(&binding.owner);
            }
        }
        debug!(
            "unregistered local {} '{}' on '{}'",
            binding.kind(),
            binding.signal,
            binding.owner
        );
    }

    /// Calls a local action's handler on the caller's thread. Handler errors
    /// are returned to the caller unchanged apart from wrapping.
    pub fn invoke_local_action(&self, owner: &NodeName, action: &NodeName, arg: &Value) -> Result<Value> {
        let binding = self
            .local
            .lock()
            .get(&(owner.clone(), action.clone(), SignalKind::Action))
            .cloned()
            .ok_or_else(|| NodelError::NoSuchBinding {
                node: owner.clone(),
                signal: action.clone(),
                kind: SignalKind::Action,
            })?;

        match &binding.handler {
            LocalHandler::Action(handler) => handler(arg).map_err(NodelError::Handler),
            LocalHandler::Event(_) => Err(NodelError::KindMismatch {
                signal: action.clone(),
                expected: SignalKind::Action,
                actual: SignalKind::Event,
            }),
        }
    }

    /// Emits a local event. Events nobody registered are silently dropped.
    /// Returns whether the event was handed to the transport.
    pub fn emit_local_event(&self, owner: &NodeName, event: &NodeName, arg: &Value) -> bool {
        let binding = self
            .local
            .lock()
            .get(&(owner.clone(), event.clone(), SignalKind::Event))
            .cloned();

        let Some(binding) = binding else {
            debug!("dropping unregistered event '{event}' from '{owner}'");
            return false;
        };

        if let LocalHandler::Event(Some(monitor)) = &binding.handler {
            guarded("event monitor", || monitor(arg));
        }
        self.transport.publish_event(owner, event, arg);
        true
    }

    /// True if any local binding is owned by `node`.
    pub fn hosts_node(&self, node: &NodeName) -> bool {
        self.local.lock().keys().any(|(owner, _, _)| owner == node)
    }

    /// Distinct owner nodes of the current local bindings.
    pub fn local_owners(&self) -> Vec<NodeName> {
        let owners: BTreeSet<NodeName> = self
            .local
            .lock()
            .keys()
            .map(|(owner, _, _)| owner.clone())
            .collect();
        owners.into_iter().collect()
    }

    /// Runs `f` over the distinct local owners with the local table locked,
    /// so no registration can slip in between. `f` may call the advertiser
    /// but must not call back into the registry.
    pub fn with_local_owners<R>(&self, f: impl FnOnce(&[NodeName]) -> R) -> R {
        let local = self.local.lock();
        let owners: BTreeSet<&NodeName> = local.keys().map(|(owner, _, _)| owner).collect();
        let owners: Vec<NodeName> = owners.into_iter().cloned().collect();
        f(&owners)
    }

    pub fn local_bindings(&self) -> Vec<Arc<LocalBinding>> {
        let mut bindings: Vec<_> = self.local.lock().values().cloned().collect();
        bindings.sort_by_key(|b| b.id);
        bindings
    }

    // ---- remote (client side) ----

    /// Registers interest in a remote signal. The binding starts `Unbound`
    /// and is resolved before this returns, so an already advertised match
    /// is `Wired` on return.
    pub fn register_remote(
        &self,
        target: &str,
        signal: impl Into<NodeName>,
        kind: SignalKind,
        callbacks: RemoteCallbacks,
    ) -> Result<Arc<RemoteBinding>> {
        if self.is_shut_down() {
            return Err(NodelError::ShutDown);
        }

        let binding = Arc::new(RemoteBinding::new(
            self.next_id(),
            target.to_string(),
            signal.into(),
            kind,
            callbacks,
        ));
        self.remote.lock().push(binding.clone());
        debug!(
            "registered remote {kind} '{}' on '{target}'",
            binding.signal
        );

        binding.evaluate(&self.resolver);
        Ok(binding)
    }

    pub fn register_remote_action(
        &self,
        target: &str,
        action: impl Into<NodeName>,
        callbacks: RemoteCallbacks,
    ) -> Result<Arc<RemoteBinding>> {
        self.register_remote(target, action, SignalKind::Action, callbacks)
    }

    pub fn register_remote_event(
        &self,
        target: &str,
        event: impl Into<NodeName>,
        callbacks: RemoteCallbacks,
    ) -> Result<Arc<RemoteBinding>> {
        self.register_remote(target, event, SignalKind::Event, callbacks)
    }

    /// Idempotent. No callback starts for the binding after this returns.
    pub fn unregister_remote(&self, binding: &RemoteBinding) {
        if binding.close() {
            debug!(
                "unregistered remote {} '{}' on '{}'",
                binding.kind, binding.signal, binding.target
            );
        }
        self.remote.lock().retain(|b| b.id != binding.id);
    }

    pub fn unregister(&self, binding: &Binding) {
        match binding {
            Binding::Local(b) => self.unregister_local(b),
            Binding::Remote(b) => self.unregister_remote(b),
        }
    }

    pub fn remote_bindings(&self) -> Vec<Arc<RemoteBinding>> {
        self.remote.lock().clone()
    }

    /// Calls a remote action through the transport. Fails with `Unbound`
    /// unless the binding is currently wired.
    pub async fn invoke_remote_action(&self, binding: &RemoteBinding, arg: &Value) -> Result<Value> {
        if binding.kind != SignalKind::Action {
            return Err(NodelError::KindMismatch {
                signal: binding.signal.clone(),
                expected: SignalKind::Action,
                actual: binding.kind,
            });
        }

        let (state, endpoint) = match binding.enter_callback() {
            Some((state, endpoint)) => {
                if let Some(monitor) = &binding.callbacks.invoke {
                    guarded("invoke monitor", || monitor(arg, state));
                }
                binding.leave_callback();
                (state, endpoint)
            }
            None => (BindingState::Unbound, None),
        };
        debug!("invoking {} '{}' while {state}", binding.kind, binding.signal);

        let endpoint = endpoint.ok_or_else(|| NodelError::Unbound {
            target: binding.target.clone(),
            signal: binding.signal.clone(),
            kind: binding.kind,
        })?;

        self.transport
            .send_action_request(&endpoint, &binding.signal, arg)
            .await
            .map_err(NodelError::Transport)
    }

    /// Inbound event from the transport. Fires `on_arrival` on every wired
    /// event binding for `event` whose wired node is `node`. Returns the
    /// number of bindings reached.
    pub fn deliver_remote_event(&self, node: &NodeName, event: &NodeName, arg: &Value) -> usize {
        let candidates: Vec<_> = self
            .remote
            .lock()
            .iter()
            .filter(|b| b.kind == SignalKind::Event && b.signal == *event)
            .cloned()
            .collect();

        let mut delivered = 0;
        for binding in candidates {
            let Some((_, endpoint)) = binding.enter_callback() else {
                continue;
            };
            if endpoint.is_some_and(|endpoint| endpoint.node == *node) {
                if let Some(handler) = &binding.callbacks.arrival {
                    guarded("event arrival handler", || handler(node, arg));
                }
                delivered += 1;
            }
            binding.leave_callback();
        }
        delivered
    }

    // ---- wiring ----

    fn on_membership_change(&self, change: &MembershipChange) {
        let name = &change.record().name;
        let affected: Vec<_> = self
            .remote
            .lock()
            .iter()
            .filter(|b| b.affected_by(name))
            .cloned()
            .collect();

        for binding in affected {
            binding.evaluate(&self.resolver);
        }
    }

    /// Re-resolve every remote binding, e.g. after the HTTP settings change.
    pub fn rewire_all(&self) {
        for binding in self.remote_bindings() {
            binding.evaluate(&self.resolver);
        }
    }

    /// Drops every binding and detaches from discovery. Idempotent; no final
    /// status callbacks are fired.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(listener) = self.listener.lock().take() {
            self.resolver.discovery().unsubscribe(&listener);
        }

        let remote = std::mem::take(&mut *self.remote.lock());
        for binding in &remote {
            binding.close();
        }

        let owners = self.local_owners();
        self.local.lock().clear();
        if let Some(advertiser) = self.advertiser.read().as_ref() {
            for owner in &owners {
                advertiser.withdraw(owner);
            }
        }

        info!(
            "binding registry shut down ({} remote, {} owner nodes released)",
            remote.len(),
            owners.len()
        );
    }
}

thread_local! {
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_callback() -> bool {
    CALLBACK_DEPTH.with(|depth| depth.get() > 0)
}

/// Runs a user callback, logging instead of unwinding through the registry.
fn guarded(what: &str, f: impl FnOnce()) {
    CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let outcome = catch_unwind(AssertUnwindSafe(f));
    CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    if outcome.is_err() {
        error!("{what} panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryRegistry;
    use crate::error::NodelError;
    use crate::fault::FaultHandler;
    use crate::resolver::HttpEndpoint;
    use crate::transport::MockTransport;
    use serde_json::json;

    struct Fixture {
        discovery: Arc<DiscoveryRegistry>,
        transport: Arc<MockTransport>,
        faults: Arc<FaultChannel>,
        registry: Arc<BindingRegistry>,
    }

    fn fixture() -> Fixture {
        let discovery = Arc::new(DiscoveryRegistry::new());
        let resolver = EndpointResolver::new(
            discovery.clone(),
            Arc::new(RwLock::new(HttpEndpoint::default())),
        );
        let transport = Arc::new(MockTransport::new());
        let faults = Arc::new(FaultChannel::new());
        let registry = BindingRegistry::new(resolver, transport.clone(), faults.clone());
        Fixture {
            discovery,
            transport,
            faults,
            registry,
        }
    }

    fn status_recorder() -> (RemoteCallbacks, Arc<Mutex<Vec<BindingState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = RemoteCallbacks::new().on_wired_status_changed(move |s| sink.lock().push(s));
        (callbacks, seen)
    }

    #[derive(Default)]
    struct RecordingAdvertiser {
        log: Mutex<Vec<String>>,
    }

    impl Advertiser for RecordingAdvertiser {
        fn advertise(&self, node: &NodeName) {
            self.log.lock().push(format!("+{}", node.reduced()));
        }

        fn withdraw(&self, node: &NodeName) {
            self.log.lock().push(format!("-{}", node.reduced()));
        }
    }

    #[test]
    fn duplicate_local_registration_is_reported_once() {
        let f = fixture();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let handler: Arc<FaultHandler> = Arc::new(move |node: &NodeName, err: &NodelError| {
            sink.lock().push((node.reduced().to_string(), err.to_string()));
        });
        f.faults.attach(handler);

        let first = f.registry.register_local_action("Projector", "Power On", |_| Ok(json!(1)));
        assert!(first.is_some());
        let second = f.registry.register_local_action("projector", "power-on", |_| Ok(json!(2)));
        assert!(second.is_none());

        let faults = faults.lock();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, "projector");
        assert!(faults[0].1.contains("already registered"));

        // the original handler is still the one that runs
        let result = f
            .registry
            .invoke_local_action(&"Projector".into(), &"PowerOn".into(), &Value::Null)
            .unwrap();
        assert_eq!(result, json!(1));
    }

    #[test]
    fn same_name_different_kind_is_not_a_duplicate() {
        let f = fixture();
        assert!(f.registry.register_local_action("Amp", "Mute", |_| Ok(Value::Null)).is_some());
        assert!(f.registry.register_local_event("Amp", "Mute", None).is_some());
        assert_eq!(f.registry.local_bindings().len(), 2);
    }

    #[test]
    fn invoke_local_action_errors() {
        let f = fixture();
        let missing = f
            .registry
            .invoke_local_action(&"Amp".into(), &"Power".into(), &Value::Null);
        assert!(matches!(missing, Err(NodelError::NoSuchBinding { .. })));

        f.registry
            .register_local_action("Amp", "Power", |_| Err(anyhow::anyhow!("relay stuck")));
        let failed = f
            .registry
            .invoke_local_action(&"Amp".into(), &"Power".into(), &Value::Null);
        match failed {
            Err(NodelError::Handler(e)) => assert_eq!(e.to_string(), "relay stuck"),
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_local_action_is_gone() {
        let f = fixture();
        let binding = f
            .registry
            .register_local_action("Amp", "Power", |_| Ok(Value::Null))
            .unwrap();
        f.registry.unregister(&Binding::Local(binding.clone()));
        f.registry.unregister(&Binding::Local(binding));
        let result = f
            .registry
            .invoke_local_action(&"Amp".into(), &"Power".into(), &Value::Null);
        assert!(matches!(result, Err(NodelError::NoSuchBinding { .. })));
    }

    #[test]
    fn emit_local_event_monitors_then_publishes() {
        let f = fixture();
        let monitored = Arc::new(Mutex::new(Vec::new()));
        let sink = monitored.clone();
        let monitor: EventMonitor = Arc::new(move |arg: &Value| sink.lock().push(arg.clone()));
        f.registry.register_local_event("Amp", "Level", Some(monitor));

        assert!(f.registry.emit_local_event(&"Amp".into(), &"Level".into(), &json!(42)));
        assert!(!f.registry.emit_local_event(&"Amp".into(), &"Volume".into(), &json!(1)));

        assert_eq!(*monitored.lock(), vec![json!(42)]);
        let published = f.transport.take_published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event.reduced(), "level");
    }

    #[test]
    fn advertiser_follows_owner_lifetime() {
        let f = fixture();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let shared: Arc<dyn Advertiser> = advertiser.clone();
        f.registry.set_advertiser(Some(shared));

        let a = f.registry.register_local_action("Amp", "Power", |_| Ok(Value::Null)).unwrap();
        let b = f.registry.register_local_event("Amp", "Level", None).unwrap();
        f.registry.unregister_local(&a);
        f.registry.unregister_local(&b);

        assert_eq!(*advertiser.log.lock(), vec!["+amp", "-amp"]);
    }

    #[test]
    fn remote_binding_wires_and_unwires_once() {
        let f = fixture();
        let (callbacks, seen) = status_recorder();
        let binding = f
            .registry
            .register_remote_action("Kitchen*", "Power", callbacks)
            .unwrap();
        assert_eq!(binding.state(), BindingState::Unbound);
        assert!(seen.lock().is_empty());

        f.discovery.observe("Kitchen Light", "10.0.0.5");
        assert_eq!(binding.state(), BindingState::Wired);
        assert_eq!(binding.wired_endpoint().unwrap().address, "10.0.0.5");

        // refresh is not a transition
        f.discovery.observe("Kitchen Light", "10.0.0.5");
        assert_eq!(*seen.lock(), vec![BindingState::Wired]);

        f.discovery.expire("Kitchen Light");
        assert_eq!(binding.state(), BindingState::Unbound);
        assert_eq!(*seen.lock(), vec![BindingState::Wired, BindingState::Unbound]);
    }

    #[test]
    fn existing_match_wires_before_register_returns() {
        let f = fixture();
        f.discovery.observe("Hall Display", "10.0.0.9");
        let (callbacks, seen) = status_recorder();
        let binding = f
            .registry
            .register_remote_event("hall display", "Input", callbacks)
            .unwrap();
        assert_eq!(binding.state(), BindingState::Wired);
        assert_eq!(*seen.lock(), vec![BindingState::Wired]);
    }

    #[test]
    fn empty_target_never_wires() {
        let f = fixture();
        f.discovery.observe("Amp", "10.0.0.5");
        let binding = f
            .registry
            .register_remote_action("", "Power", RemoteCallbacks::new())
            .unwrap();
        assert_eq!(binding.state(), BindingState::Unbound);
        let binding = f
            .registry
            .register_remote_action("*", "", RemoteCallbacks::new())
            .unwrap();
        assert_eq!(binding.state(), BindingState::Unbound);
    }

    #[test]
    fn unrelated_membership_change_does_not_notify() {
        let f = fixture();
        let (callbacks, seen) = status_recorder();
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        f.discovery.observe("Amp", "10.0.0.5");
        f.discovery.observe("Projector", "10.0.0.6");
        f.discovery.expire("Projector");
        assert_eq!(binding.state(), BindingState::Wired);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn moved_node_updates_endpoint_silently() {
        let f = fixture();
        let (callbacks, seen) = status_recorder();
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        f.discovery.observe("Amp", "10.0.0.5");
        f.discovery.observe("Amp", "10.0.0.7");
        assert_eq!(binding.wired_endpoint().unwrap().address, "10.0.0.7");
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn unregister_is_idempotent_and_silences_callbacks() {
        let f = fixture();
        let (callbacks, seen) = status_recorder();
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        f.registry.unregister_remote(&binding);
        f.registry.unregister_remote(&binding);
        assert!(binding.is_closed());
        assert!(f.registry.remote_bindings().is_empty());

        f.discovery.observe("Amp", "10.0.0.5");
        assert_eq!(binding.state(), BindingState::Unbound);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn callback_may_unregister_its_own_binding() {
        let f = fixture();
        let registry = f.registry.clone();
        let slot: Arc<Mutex<Option<Arc<RemoteBinding>>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let callbacks = {
            let slot = slot.clone();
            let calls = calls.clone();
            RemoteCallbacks::new().on_wired_status_changed(move |_| {
                *calls.lock() += 1;
                if let Some(me) = slot.lock().take() {
                    registry.unregister_remote(&me);
                }
            })
        };
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        *slot.lock() = Some(binding.clone());

        f.discovery.observe("Amp", "10.0.0.5");
        f.discovery.expire("Amp");
        f.discovery.observe("Amp", "10.0.0.5");

        assert_eq!(*calls.lock(), 1);
        assert!(binding.is_closed());
    }

    #[test]
    fn callback_may_register_new_bindings() {
        let f = fixture();
        f.discovery.observe("Amp", "10.0.0.5");
        let registry = f.registry.clone();
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        let callbacks = RemoteCallbacks::new().on_wired_status_changed(move |_| {
            let b = registry
                .register_remote_event("Amp", "Level", RemoteCallbacks::new())
                .unwrap();
            *slot.lock() = Some(b);
        });
        f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();

        let nested = nested.lock().clone().unwrap();
        assert_eq!(nested.state(), BindingState::Wired);
        assert_eq!(f.registry.remote_bindings().len(), 2);
    }

    #[test]
    fn panicking_callback_does_not_poison_registry() {
        let f = fixture();
        let callbacks = RemoteCallbacks::new().on_wired_status_changed(|_| panic!("boom"));
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        f.discovery.observe("Amp", "10.0.0.5");
        assert_eq!(binding.state(), BindingState::Wired);
        f.discovery.expire("Amp");
        assert_eq!(binding.state(), BindingState::Unbound);
    }

    #[test]
    fn wiring_thread_keeps_discovery_responsive() {
        let discovery = Arc::new(DiscoveryRegistry::new());
        let resolver = EndpointResolver::new(
            discovery.clone(),
            Arc::new(RwLock::new(HttpEndpoint::default())),
        );
        let registry = BindingRegistry::with_wiring_thread(
            resolver,
            Arc::new(MockTransport::new()),
            Arc::new(FaultChannel::new()),
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let callbacks = RemoteCallbacks::new().on_wired_status_changed(move |s| {
            std::thread::sleep(std::time::Duration::from_millis(400));
            let _ = tx.lock().send(s);
        });
        let binding = registry.register_remote_action("Slow", "Power", callbacks).unwrap();

        let started = std::time::Instant::now();
        discovery.observe("Slow", "10.0.0.1");
        discovery.observe("Other", "10.0.0.2");
        assert!(started.elapsed() < std::time::Duration::from_millis(300));
        assert_eq!(discovery.len(), 2);

        let state = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(state, BindingState::Wired);
        assert_eq!(binding.state(), BindingState::Wired);
        registry.shutdown();
    }

    #[test]
    fn unregister_waits_for_running_callback() {
        let f = fixture();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let callbacks = RemoteCallbacks::new().on_wired_status_changed(move |_| {
            let _ = entered_tx.lock().send(());
            std::thread::sleep(std::time::Duration::from_millis(200));
            done.store(true, Ordering::SeqCst);
        });
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();

        std::thread::scope(|scope| {
            let discovery = f.discovery.clone();
            scope.spawn(move || {
                discovery.observe("Amp", "10.0.0.5");
            });
            entered_rx.recv().unwrap();
            f.registry.unregister_remote(&binding);
            assert!(finished.load(Ordering::SeqCst));
        });
    }

    #[tokio::test]
    async fn invoke_remote_action_requires_wiring() {
        let f = fixture();
        let invoked = Arc::new(Mutex::new(Vec::new()));
        let sink = invoked.clone();
        let callbacks = RemoteCallbacks::new().on_invoke(move |_, state| sink.lock().push(state));
        let binding = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();

        let unbound = f.registry.invoke_remote_action(&binding, &json!(true)).await;
        assert!(matches!(unbound, Err(NodelError::Unbound { .. })));
        assert!(f.transport.take_sent().is_empty());

        f.discovery.observe("Amp", "10.0.0.5");
        f.transport.push_response(json!("on"));
        let result = f
            .registry
            .invoke_remote_action(&binding, &json!(true))
            .await
            .unwrap();
        assert_eq!(result, json!("on"));

        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint.url(), "http://10.0.0.5:8085/nodes/amp/");
        assert_eq!(
            *invoked.lock(),
            vec![BindingState::Unbound, BindingState::Wired]
        );
    }

    #[tokio::test]
    async fn invoke_remote_event_binding_is_a_kind_mismatch() {
        let f = fixture();
        let binding = f
            .registry
            .register_remote_event("Amp", "Level", RemoteCallbacks::new())
            .unwrap();
        let result = f.registry.invoke_remote_action(&binding, &Value::Null).await;
        assert!(matches!(result, Err(NodelError::KindMismatch { .. })));
    }

    #[test]
    fn remote_event_arrival_only_from_wired_node() {
        let f = fixture();
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let sink = arrivals.clone();
        let callbacks = RemoteCallbacks::new()
            .on_arrival(move |node, arg| sink.lock().push((node.reduced().to_string(), arg.clone())));
        f.registry.register_remote_event("Amp", "Level", callbacks).unwrap();

        // not wired yet
        assert_eq!(f.registry.deliver_remote_event(&"Amp".into(), &"Level".into(), &json!(1)), 0);

        f.discovery.observe("Amp", "10.0.0.5");
        assert_eq!(f.registry.deliver_remote_event(&"Amp".into(), &"Level".into(), &json!(2)), 1);
        assert_eq!(f.registry.deliver_remote_event(&"Other".into(), &"Level".into(), &json!(3)), 0);
        assert_eq!(f.registry.deliver_remote_event(&"Amp".into(), &"Mute".into(), &json!(4)), 0);

        assert_eq!(*arrivals.lock(), vec![("amp".to_string(), json!(2))]);
    }

    #[test]
    fn shutdown_releases_everything() {
        let f = fixture();
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let shared: Arc<dyn Advertiser> = advertiser.clone();
        f.registry.set_advertiser(Some(shared));
        let (callbacks, seen) = status_recorder();
        let remote = f.registry.register_remote_action("Amp", "Power", callbacks).unwrap();
        f.registry.register_local_action("Mixer", "Reset", |_| Ok(Value::Null));

        f.registry.shutdown();
        f.registry.shutdown();

        assert!(remote.is_closed());
        assert!(f.registry.local_bindings().is_empty());
        assert!(matches!(
            f.registry.register_remote_action("Amp", "Power", RemoteCallbacks::new()),
            Err(NodelError::ShutDown)
        ));
        assert!(f.registry.register_local_action("Mixer", "Reset", |_| Ok(Value::Null)).is_none());

        f.discovery.observe("Amp", "10.0.0.5");
        assert!(seen.lock().is_empty());
        assert_eq!(*advertiser.log.lock(), vec!["+mixer", "-mixer"]);
    }
}
