//! A node host: installs a bindings configuration as a set of bindings on a
//! [`NodelContext`] and routes calls between them and the host's handlers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use nodel_core::{
    BindingState, EventMonitor, LocalBinding, NodeName, NodelContext, NodelError, RemoteBinding,
    RemoteCallbacks, SignalKind,
};

use crate::activity::{ActivityKind, ActivityLog, ActivitySource};
use crate::config::BindingsConfig;
use crate::watchdog::ActiveCalls;

/// Registered when a configuration has no local bindings, so the node is
/// still advertised.
pub const DUMMY_ACTION: &str = "Dummy";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no {kind} bound to alias '{alias}'")]
    UnknownAlias { alias: String, kind: SignalKind },
    #[error("node host '{0}' is closed")]
    Closed(String),
    #[error(transparent)]
    Nodel(#[from] NodelError),
}

/// What the host does with calls and arrivals. Handlers run on whatever
/// thread delivered the call and must not call [`NodeHost::apply`].
pub trait HostHandlers: Send + Sync {
    fn on_action(&self, alias: &str, arg: &Value) -> anyhow::Result<Value>;

    fn on_remote_event(&self, _alias: &str, _from: &NodeName, _arg: &Value) {}

    fn on_binding_state(&self, _alias: &str, _kind: SignalKind, _state: BindingState) {}
}

#[derive(Default)]
struct Installed {
    locals: Vec<Arc<LocalBinding>>,
    local_events: BTreeSet<NodeName>,
    remote_actions: HashMap<String, Arc<RemoteBinding>>,
    remote_events: HashMap<String, Arc<RemoteBinding>>,
}

pub struct NodeHost {
    name: NodeName,
    ctx: Arc<NodelContext>,
    activity: Arc<ActivityLog>,
    calls: Arc<ActiveCalls>,
    installed: Mutex<Installed>,
    applying: Mutex<()>,
    closed: AtomicBool,
}

impl NodeHost {
    pub fn new(
        name: impl Into<NodeName>,
        ctx: Arc<NodelContext>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            name: name.into(),
            ctx,
            activity,
            calls: Arc::new(ActiveCalls::new()),
            installed: Mutex::new(Installed::default()),
            applying: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub fn active_calls(&self) -> &Arc<ActiveCalls> {
        &self.calls
    }

    /// Replaces the installed bindings with the ones `config` describes.
    pub fn apply(
        &self,
        config: &BindingsConfig,
        handlers: Arc<dyn HostHandlers>,
    ) -> Result<(), HostError> {
        let _applying = self.applying.lock();
        if self.is_closed() {
            return Err(HostError::Closed(self.name.to_string()));
        }

        let previous = std::mem::take(&mut *self.installed.lock());
        self.release(previous);

        let mut next = Installed::default();
        if let Err(e) = self.install(config, handlers, &mut next) {
            self.release(next);
            return Err(e);
        }

        info!(
            "'{}' applied {} local, {} remote action and {} remote event bindings",
            self.name,
            next.locals.len(),
            next.remote_actions.len(),
            next.remote_events.len()
        );
        *self.installed.lock() = next;
        Ok(())
    }

    fn install(
        &self,
        config: &BindingsConfig,
        handlers: Arc<dyn HostHandlers>,
        next: &mut Installed,
    ) -> Result<(), HostError> {
        let bindings = self.ctx.bindings();

        for alias in config.actions.keys() {
            let handler = self.action_handler(alias, handlers.clone());
            let registered = bindings.register_local_action(self.name.clone(), alias.as_str(), handler);
            if let Some(b) = registered {
                next.locals.push(b);
            }
        }

        for alias in config.events.keys() {
            let activity = self.activity.clone();
            let event_alias = alias.clone();
            let monitor: EventMonitor = Arc::new(move |arg: &Value| {
                activity.append(ActivitySource::Local, ActivityKind::Event, &event_alias, arg.clone());
            });
            let registered =
                bindings.register_local_event(self.name.clone(), alias.as_str(), Some(monitor));
            if let Some(b) = registered {
                next.local_events.insert(b.signal().clone());
                next.locals.push(b);
            }
        }

        if next.locals.is_empty() {
            debug!("'{}' has no local bindings, adding '{DUMMY_ACTION}'", self.name);
            let dummy = bindings.register_local_action(self.name.clone(), DUMMY_ACTION, |_| {
                Ok(Value::Null)
            });
            next.locals.extend(dummy);
        }

        for (alias, remote) in &config.remote.actions {
            if remote.node.trim().is_empty() || remote.action.trim().is_empty() {
                debug!("remote action '{alias}' is not fully configured and stays unbound");
            }
            let callbacks = self.remote_action_callbacks(alias, handlers.clone());
            let binding = bindings.register_remote_action(&remote.node, remote.action.as_str(), callbacks)?;
            next.remote_actions.insert(alias.clone(), binding);
        }

        for (alias, remote) in &config.remote.events {
            if remote.node.trim().is_empty() || remote.event.trim().is_empty() {
                warn!("skipping remote event '{alias}' with no node or event name");
                continue;
            }
            let callbacks = self.remote_event_callbacks(alias, handlers.clone());
            let binding = bindings.register_remote_event(&remote.node, remote.event.as_str(), callbacks)?;
            next.remote_events.insert(alias.clone(), binding);
        }

        Ok(())
    }

    fn action_handler(
        &self,
        alias: &str,
        handlers: Arc<dyn HostHandlers>,
    ) -> impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static {
        let activity = self.activity.clone();
        let calls = self.calls.clone();
        let alias = alias.to_string();
        move |arg: &Value| {
            activity.append(ActivitySource::Local, ActivityKind::Action, &alias, arg.clone());
            let _call = calls.track(format!("action '{alias}'"));
            handlers.on_action(&alias, arg)
        }
    }

    fn remote_action_callbacks(&self, alias: &str, handlers: Arc<dyn HostHandlers>) -> RemoteCallbacks {
        let invoke_activity = self.activity.clone();
        let invoke_alias = alias.to_string();
        let status_activity = self.activity.clone();
        let status_alias = alias.to_string();

        RemoteCallbacks::new()
            .on_invoke(move |arg, state| {
                let source = match state {
                    BindingState::Wired => ActivitySource::Remote,
                    BindingState::Unbound => ActivitySource::Unbound,
                };
                invoke_activity.append(source, ActivityKind::Action, &invoke_alias, arg.clone());
            })
            .on_wired_status_changed(move |state| {
                status_activity.append(
                    ActivitySource::Remote,
                    ActivityKind::ActionBinding,
                    &status_alias,
                    Value::String(state.to_string()),
                );
                handlers.on_binding_state(&status_alias, SignalKind::Action, state);
            })
    }

    fn remote_event_callbacks(&self, alias: &str, handlers: Arc<dyn HostHandlers>) -> RemoteCallbacks {
        let arrival_activity = self.activity.clone();
        let arrival_alias = alias.to_string();
        let arrival_handlers = handlers.clone();
        let calls = self.calls.clone();
        let status_activity = self.activity.clone();
        let status_alias = alias.to_string();

        RemoteCallbacks::new()
            .on_arrival(move |from, arg| {
                arrival_activity.append(ActivitySource::Remote, ActivityKind::Event, &arrival_alias, arg.clone());
                let _call = calls.track(format!("remote event '{arrival_alias}'"));
                arrival_handlers.on_remote_event(&arrival_alias, from, arg);
            })
            .on_wired_status_changed(move |state| {
                status_activity.append(
                    ActivitySource::Remote,
                    ActivityKind::EventBinding,
                    &status_alias,
                    Value::String(state.to_string()),
                );
                handlers.on_binding_state(&status_alias, SignalKind::Event, state);
            })
    }

    fn release(&self, installed: Installed) {
        let bindings = self.ctx.bindings();
        for b in installed.remote_actions.values().chain(installed.remote_events.values()) {
            bindings.unregister_remote(b);
        }
        for b in &installed.locals {
            bindings.unregister_local(b);
        }
    }

    /// Calls one of this node's own actions, as an inbound request would.
    pub fn invoke_action(&self, alias: &str, arg: &Value) -> Result<Value, HostError> {
        Ok(self
            .ctx
            .bindings()
            .invoke_local_action(&self.name, &NodeName::new(alias), arg)?)
    }

    /// Emits one of this node's configured events. Returns whether it was
    /// handed to the transport.
    pub fn emit_event(&self, alias: &str, arg: &Value) -> Result<bool, HostError> {
        let event = NodeName::new(alias);
        if !self.installed.lock().local_events.contains(&event) {
            return Err(HostError::UnknownAlias {
                alias: alias.to_string(),
                kind: SignalKind::Event,
            });
        }
        Ok(self.ctx.bindings().emit_local_event(&self.name, &event, arg))
    }

    /// Calls the remote action bound to `alias`.
    pub async fn call_remote_action(&self, alias: &str, arg: &Value) -> Result<Value, HostError> {
        let binding = self
            .installed
            .lock()
            .remote_actions
            .get(alias)
            .cloned()
            .ok_or_else(|| HostError::UnknownAlias {
                alias: alias.to_string(),
                kind: SignalKind::Action,
            })?;
        Ok(self.ctx.bindings().invoke_remote_action(&binding, arg).await?)
    }

    pub fn remote_action_state(&self, alias: &str) -> Option<BindingState> {
        self.installed.lock().remote_actions.get(alias).map(|b| b.state())
    }

    pub fn remote_event_state(&self, alias: &str) -> Option<BindingState> {
        self.installed.lock().remote_events.get(alias).map(|b| b.state())
    }

    pub fn local_bindings(&self) -> Vec<Arc<LocalBinding>> {
        self.installed.lock().locals.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unregisters every binding. Idempotent.
    pub fn close(&self) {
        let _applying = self.applying.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let installed = std::mem::take(&mut *self.installed.lock());
        self.release(installed);
        info!("node host '{}' closed", self.name);
    }
}
