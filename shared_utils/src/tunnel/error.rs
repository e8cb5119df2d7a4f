//! Error types for the tunnel module.

use std::sync::Arc;
use thiserror::Error;

use crate::backend::BackendError;
use crate::store::StoreError;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur in tunnel operations.
///
/// Collaborator failures keep their source behind an `Arc` so a single
/// outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// Name rejected before any I/O
    #[error("Invalid tunnel name: {0:?}")]
    InvalidName(String),

    /// Tunnel already exists
    #[error("Tunnel already exists: {0}")]
    AlreadyExists(String),

    /// Tunnel not found
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    /// The registry has not finished its initial load
    #[error("Tunnel registry is not loaded yet")]
    NotReady,

    /// Backend failure
    #[error("Backend failed to {op} tunnel {tunnel}: {source}")]
    Backend {
        op: &'static str,
        tunnel: String,
        #[source]
        source: Arc<BackendError>,
    },

    /// Configuration store failure
    #[error("Config store failed to {op} tunnel {tunnel}: {source}")]
    ConfigStore {
        op: &'static str,
        tunnel: String,
        #[source]
        source: Arc<StoreError>,
    },

    /// Persistent state failure
    #[error("State store failed to {op}: {source}")]
    StateStore {
        op: &'static str,
        #[source]
        source: Arc<StoreError>,
    },

    /// An operation failed and so did its compensating action
    #[error("Tunnel {tunnel} is in an inconsistent state: {op} failed ({cause}) and rollback failed ({rollback})")]
    Inconsistent {
        op: &'static str,
        tunnel: String,
        cause: Box<TunnelError>,
        rollback: Box<TunnelError>,
    },

    /// One or more tunnels failed during a bulk operation
    #[error("Failed to {op} {} tunnel(s): {}", .errors.len(), join_errors(.errors))]
    Aggregate {
        op: &'static str,
        errors: Vec<TunnelError>,
    },

    /// The worker task running the operation went away
    #[error("Worker error: {0}")]
    Worker(String),
}

fn join_errors(errors: &[TunnelError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TunnelError {
    pub(crate) fn backend(op: &'static str, tunnel: &str, source: BackendError) -> Self {
        TunnelError::Backend {
            op,
            tunnel: tunnel.to_string(),
            source: Arc::new(source),
        }
    }

    /// Wrap a config store error. `NotFound` and `AlreadyExists` are
    /// surfaced as the matching tunnel errors.
    pub(crate) fn config_store(op: &'static str, tunnel: &str, source: StoreError) -> Self {
        match source {
            StoreError::NotFound(name) => TunnelError::NotFound(name),
            StoreError::AlreadyExists(name) => TunnelError::AlreadyExists(name),
            source => TunnelError::ConfigStore {
                op,
                tunnel: tunnel.to_string(),
                source: Arc::new(source),
            },
        }
    }

    pub(crate) fn state_store(op: &'static str, source: StoreError) -> Self {
        TunnelError::StateStore {
            op,
            source: Arc::new(source),
        }
    }

    /// Whether this error means the system may not match the registry.
    pub fn is_inconsistent(&self) -> bool {
        match self {
            TunnelError::Inconsistent { .. } => true,
            TunnelError::Aggregate { errors, .. } => errors.iter().any(TunnelError::is_inconsistent),
            _ => false,
        }
    }
}
