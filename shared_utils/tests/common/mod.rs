//! In-memory collaborators with failure injection for manager tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_utils::backend::{Backend, BackendError, BackendResult};
use shared_utils::store::{ConfigStore, PersistedState, StateStore, StoreError, StoreResult};
use shared_utils::tunnel::{
    AsyncWorker, Tunnel, TunnelConfig, TunnelManager, TunnelState, TunnelStats,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|n| n.to_string()).collect()
}

#[derive(Default)]
struct BackendInner {
    active: BTreeSet<String>,
    fail_up: HashSet<String>,
    fail_down: HashSet<String>,
    fail_enumerate: bool,
    delay: Option<Duration>,
    read_delay: Option<Duration>,
    calls: Vec<String>,
}

/// Backend that tracks active interfaces in memory.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<BackendInner>,
}

impl MemoryBackend {
    pub fn with_active(active: &[&str]) -> Arc<Self> {
        let backend = MemoryBackend::default();
        backend.inner.lock().active = names(active);
        Arc::new(backend)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.inner.lock().active.contains(name)
    }

    pub fn active(&self) -> BTreeSet<String> {
        self.inner.lock().active.clone()
    }

    pub fn fail_up(&self, name: &str, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.fail_up.insert(name.to_string());
        } else {
            inner.fail_up.remove(name);
        }
    }

    pub fn fail_down(&self, name: &str, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.fail_down.insert(name.to_string());
        } else {
            inner.fail_down.remove(name);
        }
    }

    pub fn fail_enumerate(&self, fail: bool) {
        self.inner.lock().fail_enumerate = fail;
    }

    /// Slow every call down so operations overlap.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().delay = Some(delay);
    }

    /// Slow down only `enumerate` and `get_state`, after the read is taken.
    pub fn set_read_delay(&self, delay: Duration) {
        self.inner.lock().read_delay = Some(delay);
    }

    /// Bring an interface up or down behind the manager's back.
    pub fn force(&self, name: &str, up: bool) {
        let mut inner = self.inner.lock();
        if up {
            inner.active.insert(name.to_string());
        } else {
            inner.active.remove(name);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    async fn pause(&self) {
        let delay = self.inner.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn pause_read(&self) {
        let delay = self.inner.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn enumerate(&self) -> BackendResult<BTreeSet<String>> {
        self.pause().await;
        let active = {
            let inner = self.inner.lock();
            if inner.fail_enumerate {
                return Err(BackendError::Command("enumerate failed".into()));
            }
            inner.active.clone()
        };
        self.pause_read().await;
        Ok(active)
    }

    async fn get_state(&self, tunnel: &Tunnel) -> BackendResult<TunnelState> {
        self.pause().await;
        let state = TunnelState::from_active(self.is_active(&tunnel.name()));
        self.pause_read().await;
        Ok(state)
    }

    async fn get_statistics(&self, tunnel: &Tunnel) -> BackendResult<TunnelStats> {
        self.pause().await;
        let name = tunnel.name();
        if !self.is_active(&name) {
            return Ok(TunnelStats::new());
        }
        let mut stats = TunnelStats::new();
        stats.add_peer(format!("{name}-peer"), 1024, 512);
        Ok(stats)
    }

    async fn set_state(&self, tunnel: &Tunnel, target: TunnelState) -> BackendResult<TunnelState> {
        self.pause().await;
        let name = tunnel.name();
        let mut inner = self.inner.lock();
        inner.calls.push(format!("{name}:{target}"));
        match target {
            TunnelState::Up => {
                if tunnel.config().is_none() {
                    return Err(BackendError::MissingConfig(name));
                }
                if inner.fail_up.contains(&name) {
                    return Err(BackendError::Command(format!("cannot bring {name} up")));
                }
                inner.active.insert(name);
            }
            TunnelState::Down => {
                if inner.fail_down.contains(&name) {
                    return Err(BackendError::Command(format!("cannot bring {name} down")));
                }
                inner.active.remove(&name);
            }
        }
        Ok(target)
    }

    async fn apply_config(&self, _tunnel: &Tunnel, config: TunnelConfig) -> BackendResult<TunnelConfig> {
        self.pause().await;
        Ok(TunnelConfig::new(config.as_str().trim()))
    }
}

#[derive(Default)]
struct ConfigInner {
    configs: BTreeMap<String, TunnelConfig>,
    fail_delete: bool,
    fail_rename: bool,
    fail_create: bool,
    fail_load: bool,
    delay: Option<Duration>,
}

/// Config store keeping everything in a map.
#[derive(Default)]
pub struct MemoryConfigStore {
    inner: Mutex<ConfigInner>,
}

impl MemoryConfigStore {
    pub fn with_configs(list: &[&str]) -> Arc<Self> {
        let store = MemoryConfigStore::default();
        {
            let mut inner = store.inner.lock();
            for name in list {
                inner
                    .configs
                    .insert(name.to_string(), TunnelConfig::new(format!("[Interface] # {name}")));
            }
        }
        Arc::new(store)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.inner.lock().configs.keys().cloned().collect()
    }

    pub fn config(&self, name: &str) -> Option<TunnelConfig> {
        self.inner.lock().configs.get(name).cloned()
    }

    pub fn fail_delete(&self, fail: bool) {
        self.inner.lock().fail_delete = fail;
    }

    pub fn fail_rename(&self, fail: bool) {
        self.inner.lock().fail_rename = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }

    pub fn fail_load(&self, fail: bool) {
        self.inner.lock().fail_load = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().delay = Some(delay);
    }

    async fn pause(&self) {
        let delay = self.inner.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn io_error(what: &str) -> StoreError {
    StoreError::Io(io::Error::other(what.to_string()))
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn enumerate(&self) -> StoreResult<BTreeSet<String>> {
        self.pause().await;
        Ok(self.names())
    }

    async fn create(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig> {
        self.pause().await;
        let mut inner = self.inner.lock();
        if inner.fail_create {
            return Err(io_error("disk full"));
        }
        if inner.configs.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        inner.configs.insert(name.to_string(), config.clone());
        Ok(config)
    }

    async fn load(&self, name: &str) -> StoreResult<TunnelConfig> {
        self.pause().await;
        if self.inner.lock().fail_load {
            return Err(io_error("permission denied"));
        }
        self.config(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn save(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig> {
        self.pause().await;
        let mut inner = self.inner.lock();
        match inner.configs.get_mut(name) {
            Some(slot) => {
                *slot = config.clone();
                Ok(config)
            }
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock();
        if inner.fail_delete {
            return Err(io_error("read-only file system"));
        }
        inner
            .configs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn rename(&self, old: &str, new: &str) -> StoreResult<()> {
        self.pause().await;
        let mut inner = self.inner.lock();
        if inner.fail_rename {
            return Err(io_error("read-only file system"));
        }
        if inner.configs.contains_key(new) {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let config = inner
            .configs
            .remove(old)
            .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        inner.configs.insert(new.to_string(), config);
        Ok(())
    }
}

#[derive(Default)]
struct StateInner {
    state: PersistedState,
    fail_writes: bool,
    writes: usize,
    last_used_delays: BTreeMap<String, Duration>,
}

/// State store holding a [`PersistedState`] in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<StateInner>,
}

impl MemoryStateStore {
    pub fn new(state: PersistedState) -> Arc<Self> {
        let store = MemoryStateStore::default();
        store.inner.lock().state = state;
        Arc::new(store)
    }

    pub fn snapshot(&self) -> PersistedState {
        self.inner.lock().state.clone()
    }

    pub fn running(&self) -> Option<BTreeSet<String>> {
        self.inner.lock().state.running.clone()
    }

    pub fn writes(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Hold up writes of `name` as the last used tunnel.
    pub fn delay_last_used(&self, name: &str, delay: Duration) {
        self.inner.lock().last_used_delays.insert(name.to_string(), delay);
    }

    fn write(&self, apply: impl FnOnce(&mut PersistedState)) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(io_error("state file is read-only"));
        }
        apply(&mut inner.state);
        inner.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn last_used(&self) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().state.last_used.clone())
    }

    async fn set_last_used(&self, name: Option<&str>) -> StoreResult<()> {
        let delay = name.and_then(|n| self.inner.lock().last_used_delays.get(n).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let name = name.map(str::to_string);
        self.write(|s| s.last_used = name)
    }

    async fn restore_on_boot(&self) -> StoreResult<bool> {
        Ok(self.inner.lock().state.restore_on_boot)
    }

    async fn set_restore_on_boot(&self, enabled: bool) -> StoreResult<()> {
        self.write(|s| s.restore_on_boot = enabled)
    }

    async fn running_tunnels(&self) -> StoreResult<Option<BTreeSet<String>>> {
        Ok(self.running())
    }

    async fn set_running_tunnels(&self, running: &BTreeSet<String>) -> StoreResult<()> {
        let running = running.clone();
        self.write(|s| s.running = Some(running))
    }
}

/// A manager wired to in-memory collaborators.
pub struct Harness {
    pub manager: TunnelManager,
    pub backend: Arc<MemoryBackend>,
    pub configs: Arc<MemoryConfigStore>,
    pub state: Arc<MemoryStateStore>,
}

impl Harness {
    /// Build an unloaded manager.
    pub fn new(stored: &[&str], active: &[&str], state: PersistedState) -> Self {
        let backend = MemoryBackend::with_active(active);
        let configs = MemoryConfigStore::with_configs(stored);
        let state = MemoryStateStore::new(state);
        let manager = TunnelManager::new(
            backend.clone(),
            configs.clone(),
            state.clone(),
            AsyncWorker::new(4),
        );
        Harness {
            manager,
            backend,
            configs,
            state,
        }
    }

    /// Build a manager and run its initial load.
    pub async fn loaded(stored: &[&str], active: &[&str], state: PersistedState) -> Self {
        let harness = Harness::new(stored, active, state);
        harness.manager.load().await.expect("initial load");
        harness
    }

    pub fn tunnel(&self, name: &str) -> Tunnel {
        self.manager
            .get(name)
            .unwrap_or_else(|| panic!("tunnel {name} should be registered"))
    }

    /// Registry contents as `(name, state)` in registry order.
    pub async fn registry(&self) -> Vec<(String, TunnelState)> {
        self.manager
            .tunnels()
            .await
            .iter()
            .map(|t| (t.name(), t.state()))
            .collect()
    }

    /// Names the registry currently observes up.
    pub async fn observed_up(&self) -> BTreeSet<String> {
        self.manager
            .tunnels()
            .await
            .iter()
            .filter(|t| t.state().is_up())
            .map(|t| t.name())
            .collect()
    }
}

pub fn running(list: &[&str]) -> Option<BTreeSet<String>> {
    Some(names(list))
}

pub fn config(text: &str) -> TunnelConfig {
    TunnelConfig::new(text)
}
