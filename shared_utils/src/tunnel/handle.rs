//! Handle to a single registry record.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::tunnel::types::{TunnelConfig, TunnelState, TunnelStats};

#[derive(Debug)]
struct TunnelData {
    name: String,
    config: Option<TunnelConfig>,
    state: TunnelState,
    statistics: Option<TunnelStats>,
}

/// A tunnel known to the [`TunnelManager`](crate::tunnel::TunnelManager).
///
/// Cloning is cheap and every clone refers to the same record. Callers can
/// read the last observed values; all changes go through the manager.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Mutex<TunnelData>>,
}

/// Consistent copy of a tunnel's observed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub state: TunnelState,
    pub config: Option<TunnelConfig>,
    pub statistics: Option<TunnelStats>,
}

impl Tunnel {
    pub(crate) fn new(name: String, config: Option<TunnelConfig>, state: TunnelState) -> Self {
        Tunnel {
            inner: Arc::new(Mutex::new(TunnelData {
                name,
                config,
                state,
                statistics: None,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// Last observed state; not necessarily the backend's ground truth.
    pub fn state(&self) -> TunnelState {
        self.inner.lock().state
    }

    /// Cached configuration, if it has been loaded.
    pub fn config(&self) -> Option<TunnelConfig> {
        self.inner.lock().config.clone()
    }

    pub fn statistics(&self) -> Option<TunnelStats> {
        self.inner.lock().statistics.clone()
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let data = self.inner.lock();
        TunnelSnapshot {
            name: data.name.clone(),
            state: data.state,
            config: data.config.clone(),
            statistics: data.statistics.clone(),
        }
    }

    /// Returns the previous name.
    pub(crate) fn set_name(&self, name: String) -> String {
        std::mem::replace(&mut self.inner.lock().name, name)
    }

    /// Returns `true` if the observed state changed.
    pub(crate) fn set_state(&self, state: TunnelState) -> bool {
        let mut data = self.inner.lock();
        let changed = data.state != state;
        data.state = state;
        changed
    }

    pub(crate) fn set_config(&self, config: TunnelConfig) {
        self.inner.lock().config = Some(config);
    }

    pub(crate) fn set_statistics(&self, statistics: TunnelStats) {
        self.inner.lock().statistics = Some(statistics);
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Tunnel {}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("Tunnel")
            .field("name", &data.name)
            .field("state", &data.state)
            .field("config_loaded", &data.config.is_some())
            .finish()
    }
}
