//! Name registration fault notifications.
//!
//! Faults such as a duplicate local registration are not returned to the
//! code that happened to trigger them; they are multicast to whoever has
//! attached a handler here.

use std::sync::Arc;

use crate::error::NodelError;
use crate::handlers::Handlers;
use crate::names::NodeName;

pub type FaultHandler = dyn Fn(&NodeName, &NodelError) + Send + Sync;

#[derive(Default)]
pub struct FaultChannel {
    handlers: Handlers<FaultHandler>,
}

impl FaultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handler: Arc<FaultHandler>) {
        self.handlers.add(handler);
    }

    pub fn detach(&self, handler: &Arc<FaultHandler>) {
        self.handlers.remove(handler);
    }

    /// Calls every handler attached when the call starts, in attachment
    /// order. Returns the number of handlers notified.
    pub fn notify(&self, node: &NodeName, error: &NodelError) -> usize {
        let handlers = self.handlers.snapshot();
        for handler in &handlers {
            handler(node, error);
        }
        handlers.len()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
