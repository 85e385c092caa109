//! Re-applies the bindings section of the config file when it changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{load_config, BindingsConfig};
use crate::host::{HostHandlers, NodeHost};

pub struct ConfigWatch {
    path: PathBuf,
    host: Arc<NodeHost>,
    handlers: Arc<dyn HostHandlers>,
    modified: Option<SystemTime>,
    applied: Option<BindingsConfig>,
}

impl ConfigWatch {
    /// The first [`check`](Self::check) applies whatever the file holds.
    pub fn new(path: impl Into<PathBuf>, host: Arc<NodeHost>, handlers: Arc<dyn HostHandlers>) -> Self {
        Self {
            path: path.into(),
            host,
            handlers,
            modified: None,
            applied: None,
        }
    }

    /// Records `bindings` as already applied from the file as it is now.
    pub fn applied(mut self, bindings: BindingsConfig) -> Self {
        self.modified = modified_time(&self.path);
        self.applied = Some(bindings);
        self
    }

    /// Reloads the file if its modified time moved. Returns whether a new
    /// binding set was applied. On error the file is retried next check.
    pub fn check(&mut self) -> Result<bool> {
        let Some(modified) = modified_time(&self.path) else {
            debug!("config {} not readable, keeping current bindings", self.path.display());
            return Ok(false);
        };
        if self.modified == Some(modified) {
            return Ok(false);
        }

        let config = load_config(&self.path)?;
        if self.applied.as_ref() == Some(&config.bindings) {
            debug!("config {} touched, bindings unchanged", self.path.display());
            self.modified = Some(modified);
            return Ok(false);
        }

        self.host
            .apply(&config.bindings, self.handlers.clone())
            .with_context(|| format!("apply bindings from {}", self.path.display()))?;
        info!("config {} changed, bindings re-applied", self.path.display());
        self.modified = Some(modified);
        self.applied = Some(config.bindings);
        Ok(true)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub fn spawn_config_watch(
    mut config: ConfigWatch,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = config.check() {
                        warn!("config reload failed, will retry: {e:#}");
                    }
                }
            }
        }
        debug!("config watch stopped");
    })
}
