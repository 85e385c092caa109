//! Host configuration, read from `nodel.toml`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use nodel_core::NodelSettings;

pub const DEFAULT_CONFIG_FILE: &str = "nodel.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Display name of the node this host runs.
    pub node: String,
    pub nodel: NodelSettings,
    pub bindings: BindingsConfig,
    pub watchdog_interval_secs: u64,
    pub long_call_secs: u64,
    pub activity_capacity: usize,
    /// How often the config file is checked for changes.
    pub config_check_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            node: "Nodel Host".into(),
            nodel: NodelSettings::default(),
            bindings: BindingsConfig::default(),
            watchdog_interval_secs: 60,
            long_call_secs: 120,
            activity_capacity: crate::activity::DEFAULT_CAPACITY,
            config_check_secs: 10,
        }
    }
}

/// The set of signals a node exposes and consumes, keyed by alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingsConfig {
    pub actions: BTreeMap<String, LocalSignalConfig>,
    pub events: BTreeMap<String, LocalSignalConfig>,
    pub remote: RemoteBindingsConfig,
}

impl BindingsConfig {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.events.is_empty()
            && self.remote.actions.is_empty()
            && self.remote.events.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSignalConfig {
    pub title: Option<String>,
    pub desc: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBindingsConfig {
    pub actions: BTreeMap<String, RemoteActionConfig>,
    pub events: BTreeMap<String, RemoteEventConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteActionConfig {
    pub node: String,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEventConfig {
    pub node: String,
    pub event: String,
}

/// Reads `path` if it exists; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<HostConfig> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let config: HostConfig =
            toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    } else {
        Ok(HostConfig::default())
    }
}
