//! Transport abstraction for action calls and event delivery.
//!
//! The wire protocol (HTTP/JSON in a full deployment) lives behind this
//! trait. The binding registry calls it; it never implements it.

use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::binding::BindingRegistry;
use crate::names::NodeName;
use crate::resolver::NodeUrl;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Call `action` on the node at `endpoint` and wait for its result.
    async fn send_action_request(
        &self,
        endpoint: &NodeUrl,
        action: &NodeName,
        arg: &Value,
    ) -> Result<Value>;

    /// Fire-and-forget publication of a local event. Must not block.
    fn publish_event(&self, node: &NodeName, event: &NodeName, arg: &Value);
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub endpoint: NodeUrl,
    pub action: NodeName,
    pub arg: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub node: NodeName,
    pub event: NodeName,
    pub arg: Value,
}

/// Mock transport for testing: records traffic and returns canned responses.
pub struct MockTransport {
    responses: Mutex<Vec<Value>>,
    sent: Mutex<Vec<SentRequest>>,
    published: Mutex<Vec<PublishedEvent>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, value: Value) {
        self.responses.lock().push(value);
    }

    pub fn take_sent(&self) -> Vec<SentRequest> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn take_published(&self) -> Vec<PublishedEvent> {
        std::mem::take(&mut *self.published.lock())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send_action_request(
        &self,
        endpoint: &NodeUrl,
        action: &NodeName,
        arg: &Value,
    ) -> Result<Value> {
        self.sent.lock().push(SentRequest {
            endpoint: endpoint.clone(),
            action: action.clone(),
            arg: arg.clone(),
        });
        self.responses
            .lock()
            .pop()
            .ok_or_else(|| anyhow!("no canned response"))
    }

    fn publish_event(&self, node: &NodeName, event: &NodeName, arg: &Value) {
        self.published.lock().push(PublishedEvent {
            node: node.clone(),
            event: event.clone(),
            arg: arg.clone(),
        });
    }
}

/// Carries traffic between nodes hosted by the same process.
///
/// Action requests are served by the attached registry's local actions and
/// published events are delivered to its remote event bindings. Requests for
/// nodes hosted elsewhere fail.
pub struct LoopbackTransport {
    registry: RwLock<Weak<BindingRegistry>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Weak::new()),
        }
    }

    /// Holds the registry weakly; the registry owns the transport.
    pub fn attach(&self, registry: &Arc<BindingRegistry>) {
        *self.registry.write() = Arc::downgrade(registry);
    }

    fn registry(&self) -> Option<Arc<BindingRegistry>> {
        self.registry.read().upgrade()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send_action_request(
        &self,
        endpoint: &NodeUrl,
        action: &NodeName,
        arg: &Value,
    ) -> Result<Value> {
        let registry = self
            .registry()
            .ok_or_else(|| anyhow!("loopback transport is not attached"))?;
        if !registry.hosts_node(&endpoint.node) {
            return Err(anyhow!(
                "node '{}' at {} is not hosted in this process",
                endpoint.node,
                endpoint.url()
            ));
        }
        Ok(registry.invoke_local_action(&endpoint.node, action, arg)?)
    }

    fn publish_event(&self, node: &NodeName, event: &NodeName, arg: &Value) {
        if let Some(registry) = self.registry() {
            registry.deliver_remote_event(node, event, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint() -> NodeUrl {
        NodeUrl {
            node: NodeName::new("Amp"),
            address: "10.0.0.5".into(),
            port: 8085,
            suffix: "/nodes/amp/".into(),
        }
    }

    #[tokio::test]
    async fn mock_request_records_and_responds() {
        let transport = MockTransport::new();
        transport.push_response(json!("ok"));

        let result = transport
            .send_action_request(&endpoint(), &NodeName::new("Power"), &json!(true))
            .await
            .unwrap();
        assert_eq!(result, json!("ok"));

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action.reduced(), "power");
        assert_eq!(sent[0].endpoint.address, "10.0.0.5");
    }

    #[tokio::test]
    async fn mock_no_response_errors() {
        let transport = MockTransport::new();
        let result = transport
            .send_action_request(&endpoint(), &NodeName::new("Power"), &Value::Null)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn detached_loopback_errors() {
        let transport = LoopbackTransport::new();
        let result = transport
            .send_action_request(&endpoint(), &NodeName::new("Power"), &Value::Null)
            .await;
        assert!(result.is_err());
        transport.publish_event(&NodeName::new("Amp"), &NodeName::new("Level"), &json!(3));
    }
}
