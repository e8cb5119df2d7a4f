//! In-memory tunnel registry and per-name serialization.
//!
//! The registry is plain synchronous bookkeeping behind a
//! `parking_lot::Mutex`; it is never held across an `.await`. Operations
//! that suspend on collaborator I/O serialize through [`NameLocks`] and keep
//! the names they are working on reserved with a [`Reservation`].

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::handle::Tunnel;
use crate::tunnel::types::compare_names;

pub(crate) type SharedRegistry = Arc<Mutex<Registry>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameKey(String);

impl Ord for NameKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_names(&self.0, &other.0)
    }
}

impl PartialOrd for NameKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered name to tunnel mapping plus the names held by in-flight operations.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    tunnels: BTreeMap<NameKey, Tunnel>,
    reserved: HashSet<String>,
    last_used: Option<Tunnel>,
}

impl Registry {
    pub(crate) fn get(&self, name: &str) -> Option<Tunnel> {
        self.tunnels.get(&NameKey(name.to_string())).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.tunnels.contains_key(&NameKey(name.to_string()))
    }

    /// Registered, or held by an operation in flight.
    pub(crate) fn is_taken(&self, name: &str) -> bool {
        self.contains(name) || self.reserved.contains(name)
    }

    /// Whether this exact record is registered under its current name.
    pub(crate) fn is_registered(&self, tunnel: &Tunnel) -> bool {
        self.get(&tunnel.name()).is_some_and(|t| &t == tunnel)
    }

    /// Returns `false` if the name is already registered.
    pub(crate) fn insert(&mut self, tunnel: Tunnel) -> bool {
        let key = NameKey(tunnel.name());
        if self.tunnels.contains_key(&key) {
            return false;
        }
        self.tunnels.insert(key, tunnel);
        true
    }

    pub(crate) fn remove(&mut self, tunnel: &Tunnel) -> bool {
        let key = NameKey(tunnel.name());
        match self.tunnels.get(&key) {
            Some(existing) if existing == tunnel => {
                self.tunnels.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.values().cloned().collect()
    }

    /// Names of every tunnel currently observed up.
    pub(crate) fn running_names(&self) -> BTreeSet<String> {
        self.tunnels
            .iter()
            .filter(|(_, t)| t.state().is_up())
            .map(|(k, _)| k.0.clone())
            .collect()
    }

    pub(crate) fn last_used(&self) -> Option<Tunnel> {
        self.last_used.clone()
    }

    pub(crate) fn is_last_used(&self, tunnel: &Tunnel) -> bool {
        self.last_used.as_ref() == Some(tunnel)
    }

    /// Returns `true` if the pointer changed.
    pub(crate) fn set_last_used(&mut self, tunnel: Option<Tunnel>) -> bool {
        if self.last_used == tunnel {
            return false;
        }
        self.last_used = tunnel;
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.tunnels.len()
    }
}

/// Names held by an in-flight operation; released on drop.
#[must_use]
pub(crate) struct Reservation {
    registry: SharedRegistry,
    names: Vec<String>,
}

impl Reservation {
    /// Reserve a name that must be neither registered nor reserved.
    pub(crate) fn new_name(registry: &SharedRegistry, name: &str) -> TunnelResult<Self> {
        let mut guard = registry.lock();
        if guard.is_taken(name) {
            return Err(TunnelError::AlreadyExists(name.to_string()));
        }
        guard.reserved.insert(name.to_string());
        Ok(Reservation {
            registry: registry.clone(),
            names: vec![name.to_string()],
        })
    }

    /// Remove a registered tunnel from the map while keeping its name
    /// reserved, so it is invisible to queries but cannot be reused.
    pub(crate) fn withdraw(registry: &SharedRegistry, tunnel: &Tunnel) -> TunnelResult<Self> {
        let name = tunnel.name();
        let mut guard = registry.lock();
        if !guard.remove(tunnel) {
            return Err(TunnelError::NotFound(name));
        }
        guard.reserved.insert(name.clone());
        Ok(Reservation {
            registry: registry.clone(),
            names: vec![name],
        })
    }

    /// Fold another reservation into this one.
    pub(crate) fn merge(mut self, mut other: Reservation) -> Self {
        self.names.append(&mut other.names);
        self
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut guard = self.registry.lock();
        for name in &self.names {
            guard.reserved.remove(name);
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Async lock per tunnel name giving every name a total order of operations.
#[derive(Debug, Default)]
pub(crate) struct NameLocks {
    locks: LockTable,
}

impl NameLocks {
    pub(crate) async fn lock(&self, name: &str) -> NameGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.entry(name.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        NameGuard {
            name: name.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held lock on one tunnel name.
pub(crate) struct NameGuard {
    name: String,
    locks: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameGuard {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.guard.take();
        // Drop the entry once nobody else holds or waits on it.
        if locks
            .get(&self.name)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.name);
        }
    }
}
