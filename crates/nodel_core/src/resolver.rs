//! Endpoint resolution: advertisement records to HTTP node URLs.
//!
//! Endpoints are computed on demand from the current records and the
//! current port/suffix settings; nothing here is cached.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::discovery::{AdvertisementRecord, DiscoveryRegistry};
use crate::names::NodeName;

pub const NODE_PLACEHOLDER: &str = "%NODE%";
pub const DEFAULT_HTTP_SUFFIX: &str = "/nodes/%NODE%/";
pub const DEFAULT_HTTP_PORT: u16 = 8085;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeUrl {
    pub node: NodeName,
    pub address: String,
    pub port: u16,
    pub suffix: String,
}

impl NodeUrl {
    pub fn url(&self) -> String {
        if self.address.contains(':') {
            format!("http://[{}]:{}{}", self.address, self.port, self.suffix)
        } else {
            format!("http://{}:{}{}", self.address, self.port, self.suffix)
        }
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Process-wide HTTP settings shared by every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoint {
    pub port: u16,
    pub suffix: String,
}

impl Default for HttpEndpoint {
    fn default() -> Self {
        Self {
            port: DEFAULT_HTTP_PORT,
            suffix: DEFAULT_HTTP_SUFFIX.to_string(),
        }
    }
}

pub fn resolve(record: &AdvertisementRecord, port: u16, suffix_template: &str) -> NodeUrl {
    NodeUrl {
        node: record.name.clone(),
        address: record.address.clone(),
        port,
        suffix: suffix_template.replace(NODE_PLACEHOLDER, record.name.reduced()),
    }
}

#[derive(Clone)]
pub struct EndpointResolver {
    discovery: Arc<DiscoveryRegistry>,
    endpoint: Arc<RwLock<HttpEndpoint>>,
}

impl EndpointResolver {
    pub fn new(discovery: Arc<DiscoveryRegistry>, endpoint: Arc<RwLock<HttpEndpoint>>) -> Self {
        Self {
            discovery,
            endpoint,
        }
    }

    pub fn discovery(&self) -> &Arc<DiscoveryRegistry> {
        &self.discovery
    }

    pub fn endpoint(&self) -> HttpEndpoint {
        self.endpoint.read().clone()
    }

    pub fn set_port(&self, port: u16) {
        self.endpoint.write().port = port;
    }

    pub fn set_suffix(&self, suffix: impl Into<String>) {
        self.endpoint.write().suffix = suffix.into();
    }

    /// Endpoints for nodes matching the wildcard `filter`, narrowed by an
    /// optional case-insensitive substring of the display name. One entry
    /// per node, ordered by reduced name then address.
    pub fn resolve_all(&self, filter: &str, contains: Option<&str>) -> Vec<NodeUrl> {
        self.resolve_records(self.discovery.enumerate(filter), contains)
    }

    /// Every known node, narrowed by an optional substring of the display
    /// name.
    pub fn node_urls(&self, contains: Option<&str>) -> Vec<NodeUrl> {
        self.resolve_records(self.discovery.list(), contains)
    }

    fn resolve_records(
        &self,
        records: Vec<AdvertisementRecord>,
        contains: Option<&str>,
    ) -> Vec<NodeUrl> {
        let HttpEndpoint { port, suffix } = self.endpoint();
        let needle = contains
            .filter(|c| !c.is_empty())
            .map(str::to_lowercase);

        let mut seen = HashSet::new();
        let mut urls: Vec<NodeUrl> = records
            .iter()
            .filter(|r| match &needle {
                Some(needle) => r.name.original().to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .filter(|r| seen.insert(r.name.clone()))
            .map(|r| resolve(r, port, &suffix))
            .collect();

        urls.sort_by(|a, b| {
            a.node
                .cmp(&b.node)
                .then_with(|| a.address.cmp(&b.address))
        });
        urls
    }
}
