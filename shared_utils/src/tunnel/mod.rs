//! Tunnel registry and orchestration for TunnelKeeper.
//!
//! [`TunnelManager`] is the single entry point. It keeps the in-memory set of
//! [`Tunnel`] handles consistent with the configuration store, the backend
//! that actually runs interfaces, and the small persisted state used to
//! restore tunnels after a restart.

mod error;
mod handle;
mod manager;
mod registry;
mod trigger;
pub mod types;
mod worker;

pub use error::{TunnelError, TunnelResult};
pub use handle::{Tunnel, TunnelSnapshot};
pub use manager::TunnelManager;
pub use trigger::{Trigger, TriggerRouter};
pub use types::{
    compare_names, validate_name, PeerStats, TunnelConfig, TunnelEvent, TunnelState, TunnelStats,
    MAX_NAME_LEN,
};
pub use worker::{AsyncWorker, DEFAULT_WORKERS};
