//! Error types for the reactive resolution engine.
//!
//! All errors are strongly typed using thiserror. Registry errors are the
//! invariant violations of stage wiring; execution errors are what a query
//! observes while draining answers.

use thiserror::Error;

use crate::reactive::identifier::{BlockId, ReactiveIdentifier, Role};

/// Pull/push bookkeeping violations raised by the registries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Single-peer registry already holds {existing}, cannot register {attempted}")]
    SinglePeerViolation {
        existing: ReactiveIdentifier,
        attempted: ReactiveIdentifier,
    },

    #[error("Peer {peer} was never registered")]
    UnknownPeer {
        peer: ReactiveIdentifier,
    },
}

/// Errors raised while building or routing the dataflow network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WiringError {
    #[error("Stage {id} cannot act as a {role}")]
    WrongRole {
        id: ReactiveIdentifier,
        role: Role,
    },

    #[error("Stage not found: {id}")]
    UnknownStage {
        id: ReactiveIdentifier,
    },

    #[error("Reactive block not found: {block}")]
    UnknownBlock {
        block: BlockId,
    },

    #[error("Failed to spawn actor thread: {message}")]
    SpawnFailed {
        message: String,
    },
}

/// Errors observed by callers waiting on the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Resolution terminated: {cause}")]
    Terminated {
        cause: String,
    },
}

/// Top-level error type for the reasoner.
#[derive(Debug, Error)]
pub enum ReactiveError {
    #[error("Registry invariant violated: {0}")]
    Registry(#[from] RegistryError),

    #[error("Wiring error: {0}")]
    Wiring(#[from] WiringError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ReactiveError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for programming errors in stage wiring.
    ///
    /// These abort the enclosing resolution rather than being tolerated.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::Wiring(WiringError::WrongRole { .. }))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }
}

/// Result type alias for reasoner operations.
pub type ReactiveResult<T> = Result<T, ReactiveError>;
