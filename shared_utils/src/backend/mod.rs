//! Backends that bring tunnel interfaces up and down.
//!
//! The [`Backend`] trait is the boundary between the tunnel manager and
//! whatever actually configures interfaces. Calls may block on privileged
//! processes, so the manager always drives them from its worker pool.

mod wg_quick;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::tunnel::{Tunnel, TunnelConfig, TunnelState, TunnelStats};

pub use wg_quick::WgQuickBackend;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error type for backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System command error
    #[error("System command error: {0}")]
    Command(String),

    /// Unparsable tool output
    #[error("Failed to parse backend output: {0}")]
    Parse(String),

    /// Activation requested before the configuration was loaded
    #[error("No configuration loaded for tunnel {0}")]
    MissingConfig(String),
}

/// Interface backend trait
#[async_trait]
pub trait Backend: Send + Sync {
    /// Names of the tunnels that are currently active
    async fn enumerate(&self) -> BackendResult<BTreeSet<String>>;

    /// Current activation state of a tunnel
    async fn get_state(&self, tunnel: &Tunnel) -> BackendResult<TunnelState>;

    /// Transfer statistics of a tunnel
    async fn get_statistics(&self, tunnel: &Tunnel) -> BackendResult<TunnelStats>;

    /// Move a tunnel to `target`, returning the resulting state
    async fn set_state(&self, tunnel: &Tunnel, target: TunnelState) -> BackendResult<TunnelState>;

    /// Apply a configuration, returning it as the backend will use it
    async fn apply_config(&self, tunnel: &Tunnel, config: TunnelConfig)
        -> BackendResult<TunnelConfig>;
}
