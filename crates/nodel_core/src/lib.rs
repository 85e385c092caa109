//! Nodel core: zero-config discovery and wiring of actions and events
//! between nodes.
//!
//! Nodes advertise themselves, the discovery registry tracks who is around,
//! and the binding registry wires remote bindings to matching nodes as they
//! come and go.

pub mod binding;
pub mod context;
pub mod discovery;
pub mod error;
pub mod fault;
pub mod handlers;
pub mod names;
pub mod resolver;
pub mod transport;

pub use binding::{
    Advertiser, Binding, BindingRegistry, BindingState, EventMonitor, LocalBinding, LocalHandler,
    RemoteBinding, RemoteCallbacks, SignalKind,
};
pub use context::{NodelContext, NodelSettings};
pub use discovery::{
    AdvertisementRecord, ChannelSource, DiscoveryRegistry, DiscoverySource, MembershipChange,
    SourceEvent,
};
pub use error::{NodelError, Result};
pub use fault::{FaultChannel, FaultHandler};
pub use names::NodeName;
pub use resolver::{EndpointResolver, HttpEndpoint, NodeUrl};
pub use transport::{LoopbackTransport, MockTransport, Transport};

/// Framework version, carried in advertisements.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
