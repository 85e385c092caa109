use thiserror::Error;

use crate::binding::SignalKind;
use crate::names::NodeName;

#[derive(Debug, Error)]
pub enum NodelError {
    #[error("{kind} '{signal}' is already registered on node '{node}'")]
    DuplicateRegistration {
        node: NodeName,
        signal: NodeName,
        kind: SignalKind,
    },
    #[error("{kind} '{signal}' on '{target}' is not wired to any node")]
    Unbound {
        target: String,
        signal: NodeName,
        kind: SignalKind,
    },
    #[error("no local {kind} '{signal}' on node '{node}'")]
    NoSuchBinding {
        node: NodeName,
        signal: NodeName,
        kind: SignalKind,
    },
    #[error("'{signal}' is an {actual}, not an {expected}")]
    KindMismatch {
        signal: NodeName,
        expected: SignalKind,
        actual: SignalKind,
    },
    #[error("no endpoint resolvable for '{filter}'")]
    ResolutionFailure { filter: String },
    #[error("action handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
    #[error("nodel context has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, NodelError>;
