//! Durable storage used by the tunnel manager.
//!
//! [`ConfigStore`] keeps each tunnel's configuration; [`StateStore`] keeps
//! the small amount of manager state that must survive a restart (last-used
//! tunnel, restore-on-boot flag, running set).

mod file;
mod state;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use thiserror::Error;

use crate::tunnel::TunnelConfig;

pub use file::FileConfigStore;
pub use state::{JsonStateStore, PersistedState};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error (de)serializing persisted state
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Nothing stored under this name
    #[error("No configuration stored for {0}")]
    NotFound(String),

    /// Something is already stored under this name
    #[error("Configuration already exists for {0}")]
    AlreadyExists(String),
}

/// Name to configuration store, independent of runtime state.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Names of every stored configuration
    async fn enumerate(&self) -> StoreResult<BTreeSet<String>>;

    /// Store a configuration under a new name
    async fn create(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig>;

    /// Load a stored configuration
    async fn load(&self, name: &str) -> StoreResult<TunnelConfig>;

    /// Replace an existing configuration
    async fn save(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig>;

    /// Delete a stored configuration
    async fn delete(&self, name: &str) -> StoreResult<()>;

    /// Move a configuration to a new name
    async fn rename(&self, old: &str, new: &str) -> StoreResult<()>;
}

/// Small key-value store for manager state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn last_used(&self) -> StoreResult<Option<String>>;

    /// `None` clears the value
    async fn set_last_used(&self, name: Option<&str>) -> StoreResult<()>;

    async fn restore_on_boot(&self) -> StoreResult<bool>;

    async fn set_restore_on_boot(&self, enabled: bool) -> StoreResult<()>;

    /// Tunnels that were up at the last save, `None` if never saved
    async fn running_tunnels(&self) -> StoreResult<Option<BTreeSet<String>>>;

    async fn set_running_tunnels(&self, names: &BTreeSet<String>) -> StoreResult<()>;
}
