use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use nodel_core::{BindingState, LoopbackTransport, NodeName, NodelContext, SignalKind};
use nodel_host::config::DEFAULT_CONFIG_FILE;
use nodel_host::{
    load_config, spawn_config_watch, spawn_watchdog, ActivityLog, ConfigWatch, HostHandlers,
    NodeHost,
};
use nodel_mdns::MdnsSource;

/// Logs every call and acknowledges actions with a null result.
struct LoggingHandlers;

impl HostHandlers for LoggingHandlers {
    fn on_action(&self, alias: &str, arg: &Value) -> Result<Value> {
        tracing::info!("action {alias}({arg})");
        Ok(Value::Null)
    }

    fn on_remote_event(&self, alias: &str, from: &NodeName, arg: &Value) {
        tracing::info!("event {alias}({arg}) from '{from}'");
    }

    fn on_binding_state(&self, alias: &str, kind: SignalKind, state: BindingState) {
        tracing::info!("remote {kind} '{alias}' is {state}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path)?;

    tracing::info!("Nodel {} starting...", nodel_core::VERSION);
    tracing::info!("node       = {}", config.node);
    tracing::info!("http_port  = {}", config.nodel.http_port);
    tracing::info!("interface  = {:?}", config.nodel.interface);

    let source = Arc::new(MdnsSource::new().context("start mDNS discovery")?);
    let transport = Arc::new(LoopbackTransport::new());
    let ctx = NodelContext::init(config.nodel.clone(), source, transport.clone())?;
    transport.attach(ctx.bindings());

    let activity = Arc::new(ActivityLog::new(config.activity_capacity));
    let host = Arc::new(NodeHost::new(config.node.as_str(), ctx.clone(), activity));
    let handlers: Arc<dyn HostHandlers> = Arc::new(LoggingHandlers);
    host.apply(&config.bindings, handlers.clone())
        .context("apply bindings")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = spawn_watchdog(
        host.active_calls().clone(),
        Duration::from_secs(config.watchdog_interval_secs),
        Duration::from_secs(config.long_call_secs),
        shutdown_rx.clone(),
    );
    let reload = spawn_config_watch(
        ConfigWatch::new(config_path.clone(), host.clone(), handlers).applied(config.bindings.clone()),
        Duration::from_secs(config.config_check_secs),
        shutdown_rx,
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    host.close();
    ctx.shutdown();
    watchdog.await.context("join watchdog")?;
    reload.await.context("join config watch")?;
    Ok(())
}
