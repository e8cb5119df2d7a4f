//! Shared library for TunnelKeeper components.
//!
//! This crate holds everything the daemon and the control client have in
//! common: the tunnel manager and its collaborators, configuration loading,
//! and logging setup.

pub mod backend;
pub mod config;
pub mod logging;
pub mod store;
pub mod tunnel;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigManager};
pub use tunnel::{Tunnel, TunnelError, TunnelManager, TunnelState};
