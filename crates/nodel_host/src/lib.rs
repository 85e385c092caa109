//! Node host: bindings configuration, activity log, call watchdog, config
//! reload.

pub mod activity;
pub mod config;
pub mod host;
pub mod reload;
pub mod watchdog;

pub use activity::{ActivityEntry, ActivityKind, ActivityLog, ActivitySource};
pub use config::{load_config, BindingsConfig, HostConfig};
pub use host::{HostError, HostHandlers, NodeHost};
pub use reload::{spawn_config_watch, ConfigWatch};
pub use watchdog::{spawn_watchdog, ActiveCalls};
