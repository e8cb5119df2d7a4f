//! Tunnel management abstraction.
//!
//! [`TunnelManager`] owns the registry of known tunnels and mediates every
//! change between the registry, the [`ConfigStore`], the [`Backend`] and the
//! persisted [`StateStore`]. Each mutating operation runs on its own task,
//! serialized per tunnel name, and undoes its partial work when a
//! collaborator fails.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, WgQuickBackend};
use crate::config::Config as GlobalConfig;
use crate::store::{ConfigStore, FileConfigStore, JsonStateStore, StateStore};
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::handle::Tunnel;
use crate::tunnel::registry::{NameGuard, NameLocks, Reservation, SharedRegistry};
use crate::tunnel::types::{
    validate_name, TunnelConfig, TunnelEvent, TunnelState, TunnelStats,
};
use crate::tunnel::worker::{detach, AsyncWorker};

const EVENT_CAPACITY: usize = 64;

/// Manager for the set of known tunnels.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Readiness {
    loading: bool,
    loaded: bool,
    /// Restore requests that arrived before the initial load finished
    delayed: Vec<oneshot::Sender<TunnelResult<()>>>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config_store: Arc<dyn ConfigStore>,
    state_store: Arc<dyn StateStore>,
    worker: AsyncWorker,
    registry: SharedRegistry,
    locks: NameLocks,
    readiness: Mutex<Readiness>,
    ready: watch::Sender<bool>,
    /// Serializes running-set writes so the last write is the freshest
    save_lock: tokio::sync::Mutex<()>,
    /// Serializes last-used pointer moves together with their writes
    last_used_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelManager {
    /// Create a manager over the given collaborators. Nothing is read until
    /// [`load`](Self::load) is called.
    pub fn new(
        backend: Arc<dyn Backend>,
        config_store: Arc<dyn ConfigStore>,
        state_store: Arc<dyn StateStore>,
        worker: AsyncWorker,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        TunnelManager {
            inner: Arc::new(Inner {
                backend,
                config_store,
                state_store,
                worker,
                registry: SharedRegistry::default(),
                locks: NameLocks::default(),
                readiness: Mutex::new(Readiness::default()),
                ready,
                save_lock: tokio::sync::Mutex::new(()),
                last_used_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Create a manager backed by the file stores and `wg-quick`, as
    /// described by the global configuration.
    pub async fn from_config(config: &GlobalConfig) -> Self {
        let state_store = JsonStateStore::open(&config.storage.state_file).await;
        TunnelManager::new(
            Arc::new(WgQuickBackend::new(&config.backend)),
            Arc::new(FileConfigStore::new(&config.storage.config_dir)),
            Arc::new(state_store),
            AsyncWorker::new(config.workers),
        )
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the initial load has completed.
    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    fn ensure_ready(&self) -> TunnelResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(TunnelError::NotReady)
        }
    }

    /// All tunnels in registry order, once loaded.
    pub async fn tunnels(&self) -> Vec<Tunnel> {
        self.wait_ready().await;
        self.inner.registry.lock().tunnels()
    }

    pub fn get(&self, name: &str) -> Option<Tunnel> {
        self.inner.registry.lock().get(name)
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// The most recently activated tunnel, if any.
    pub fn last_used(&self) -> Option<Tunnel> {
        self.inner.registry.lock().last_used()
    }

    /// Build the registry from the config store and the backend's active
    /// set, then release any restore requests queued in the meantime.
    pub async fn load(&self) -> TunnelResult<()> {
        {
            let mut readiness = self.inner.readiness.lock();
            if readiness.loaded || readiness.loading {
                warn!("Tunnel registry load requested twice; ignoring");
                return Ok(());
            }
            readiness.loading = true;
        }
        let inner = self.inner.clone();
        detach(async move { inner.load().await }).await
    }

    /// Store a new configuration and register it as a down tunnel.
    pub async fn create(&self, name: &str, config: TunnelConfig) -> TunnelResult<Tunnel> {
        validate_name(name)?;
        self.ensure_ready()?;
        let reservation = Reservation::new_name(&self.inner.registry, name)?;
        let inner = self.inner.clone();
        let name = name.to_string();
        detach(async move {
            let _reservation = reservation;
            inner.create(name, config).await
        })
        .await
    }

    /// Deactivate a tunnel if needed and delete its configuration.
    pub async fn delete(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move { inner.delete(tunnel).await }).await
    }

    /// Rename a tunnel, bouncing it if it is up. Returns the new name.
    pub async fn rename(&self, tunnel: &Tunnel, new_name: &str) -> TunnelResult<String> {
        validate_name(new_name)?;
        self.ensure_ready()?;
        if self.inner.registry.lock().is_taken(new_name) {
            return Err(TunnelError::AlreadyExists(new_name.to_string()));
        }
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        let new_name = new_name.to_string();
        detach(async move { inner.rename(tunnel, new_name).await }).await
    }

    /// Bring a tunnel up or down. The running set is saved either way.
    pub async fn set_state(&self, tunnel: &Tunnel, target: TunnelState) -> TunnelResult<TunnelState> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move { inner.set_state(tunnel, target).await }).await
    }

    /// Apply a new configuration through the backend and store the result.
    pub async fn set_config(&self, tunnel: &Tunnel, config: TunnelConfig) -> TunnelResult<TunnelConfig> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move {
            let _lock = inner.lock_tunnel(&tunnel).await?;
            inner.set_config(&tunnel, config).await
        })
        .await
    }

    /// Reload a tunnel's configuration from the store.
    pub async fn load_config(&self, tunnel: &Tunnel) -> TunnelResult<TunnelConfig> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move {
            let _lock = inner.lock_tunnel(&tunnel).await?;
            inner.fetch_config(&tunnel).await
        })
        .await
    }

    /// Ask the backend for a tunnel's state and record it.
    pub async fn refresh_state(&self, tunnel: &Tunnel) -> TunnelResult<TunnelState> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move {
            let _lock = inner.lock_tunnel(&tunnel).await?;
            let state = inner.backend_get_state(&tunnel).await?;
            inner.update_state(&tunnel, state);
            Ok(state)
        })
        .await
    }

    /// Fetch fresh transfer statistics for a tunnel.
    pub async fn refresh_statistics(&self, tunnel: &Tunnel) -> TunnelResult<TunnelStats> {
        self.ensure_ready()?;
        let inner = self.inner.clone();
        let tunnel = tunnel.clone();
        detach(async move {
            let _lock = inner.lock_tunnel(&tunnel).await?;
            let name = tunnel.name();
            let backend = inner.backend.clone();
            let t = tunnel.clone();
            let stats = inner
                .worker
                .try_run(async move { backend.get_statistics(&t).await }, |e| {
                    TunnelError::backend("read statistics of", &name, e)
                })
                .await?;
            tunnel.set_statistics(stats.clone());
            inner.emit(TunnelEvent::StatisticsChanged { name });
            Ok(stats)
        })
        .await
    }

    /// Re-poll the backend and update every tunnel's observed state.
    ///
    /// Each tunnel is queried under its name lock so a concurrent state
    /// change is never overwritten by an older reading. Tunnels removed in
    /// the meantime are skipped. The persisted running set is left alone.
    pub async fn refresh_tunnel_states(&self) -> TunnelResult<()> {
        self.wait_ready().await;
        let inner = self.inner.clone();
        detach(async move {
            let tunnels = inner.registry.lock().tunnels();
            let results = join_all(tunnels.iter().map(|tunnel| {
                let inner = inner.clone();
                async move {
                    let _lock = match inner.lock_tunnel(tunnel).await {
                        Ok(lock) => lock,
                        Err(TunnelError::NotFound(_)) => return Ok(tunnel.state()),
                        Err(e) => return Err(e),
                    };
                    let state = inner.backend_get_state(tunnel).await?;
                    inner.update_state(tunnel, state);
                    Ok(state)
                }
            }))
            .await;
            debug!(count = tunnels.len(), "Refreshed tunnel states");
            collect_failures("refresh", results)
        })
        .await
    }

    /// Bring down every tunnel currently observed up.
    pub async fn set_all_down(&self) -> TunnelResult<()> {
        let up: Vec<Tunnel> = self
            .tunnels()
            .await
            .into_iter()
            .filter(|t| t.state().is_up())
            .collect();
        info!(count = up.len(), "Bringing all tunnels down");
        let results = join_all(up.iter().map(|t| self.set_state(t, TunnelState::Down))).await;
        collect_failures("deactivate", results)
    }

    /// Bring up every tunnel recorded in the persisted running set.
    ///
    /// Without `force` this only happens when restore-on-boot is enabled.
    /// Requests made before the registry is loaded are queued and resolved
    /// once it is.
    pub async fn restore_state(&self, force: bool) -> TunnelResult<()> {
        if !force && !self.restore_on_boot().await? {
            debug!("Restore on boot disabled; not restoring tunnels");
            return Ok(());
        }

        let waiter = {
            let mut readiness = self.inner.readiness.lock();
            if readiness.loaded {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                readiness.delayed.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = waiter {
            debug!("Registry not loaded; restore queued");
            return rx.await.unwrap_or(Err(TunnelError::NotReady));
        }

        let inner = self.inner.clone();
        detach(async move { inner.restore_running().await }).await
    }

    /// Persist the names of all tunnels currently observed up.
    pub async fn save_state(&self) -> TunnelResult<()> {
        self.inner.save_state().await
    }

    pub async fn restore_on_boot(&self) -> TunnelResult<bool> {
        let store = self.inner.state_store.clone();
        self.inner
            .worker
            .try_run(async move { store.restore_on_boot().await }, |e| {
                TunnelError::state_store("read restore-on-boot flag", e)
            })
            .await
    }

    pub async fn set_restore_on_boot(&self, enabled: bool) -> TunnelResult<()> {
        let store = self.inner.state_store.clone();
        self.inner
            .worker
            .try_run(async move { store.set_restore_on_boot(enabled).await }, |e| {
                TunnelError::state_store("write restore-on-boot flag", e)
            })
            .await
    }
}

fn collect_failures(op: &'static str, results: Vec<TunnelResult<TunnelState>>) -> TunnelResult<()> {
    let errors: Vec<TunnelError> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TunnelError::Aggregate { op, errors })
    }
}

impl Inner {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn update_state(&self, tunnel: &Tunnel, state: TunnelState) {
        if tunnel.set_state(state) {
            self.emit(TunnelEvent::StateChanged {
                name: tunnel.name(),
                state,
            });
        }
    }

    fn reinsert(&self, tunnel: &Tunnel) {
        let name = tunnel.name();
        if self.registry.lock().insert(tunnel.clone()) {
            self.emit(TunnelEvent::Added { name });
        } else {
            error!(tunnel = %name, "Could not put tunnel back: name is registered");
        }
    }

    /// Lock the tunnel's current name and check it is still registered.
    /// Follows the tunnel if it was renamed while we waited.
    async fn lock_tunnel(&self, tunnel: &Tunnel) -> TunnelResult<NameGuard> {
        loop {
            let name = tunnel.name();
            let guard = self.locks.lock(&name).await;
            if tunnel.name() != guard.name() {
                continue;
            }
            if !self.registry.lock().is_registered(tunnel) {
                return Err(TunnelError::NotFound(name));
            }
            return Ok(guard);
        }
    }

    /// Move the last-used pointer and persist it. The in-memory pointer is
    /// put back if the write fails.
    ///
    /// Moves are serialized, so the stored name always matches the last
    /// pointer set in memory.
    async fn set_last_used(&self, tunnel: Option<&Tunnel>) -> TunnelResult<()> {
        let _guard = self.last_used_lock.lock().await;
        let previous = {
            let mut registry = self.registry.lock();
            let previous = registry.last_used();
            if !registry.set_last_used(tunnel.cloned()) {
                return Ok(());
            }
            previous
        };

        let name = tunnel.map(Tunnel::name);
        let store = self.state_store.clone();
        let stored = name.clone();
        let result = self
            .worker
            .try_run(
                async move { store.set_last_used(stored.as_deref()).await },
                |e| TunnelError::state_store("write last used tunnel", e),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(tunnel = ?name, "Last used tunnel changed");
                self.emit(TunnelEvent::LastUsedChanged { name });
                Ok(())
            }
            Err(e) => {
                self.registry.lock().set_last_used(previous);
                Err(e)
            }
        }
    }

    async fn backend_enumerate(&self) -> TunnelResult<std::collections::BTreeSet<String>> {
        let backend = self.backend.clone();
        self.worker
            .try_run(async move { backend.enumerate().await }, |e| {
                TunnelError::backend("enumerate", "*", e)
            })
            .await
    }

    async fn backend_get_state(&self, tunnel: &Tunnel) -> TunnelResult<TunnelState> {
        let name = tunnel.name();
        let backend = self.backend.clone();
        let t = tunnel.clone();
        self.worker
            .try_run(async move { backend.get_state(&t).await }, |e| {
                TunnelError::backend("query", &name, e)
            })
            .await
    }

    async fn backend_set_state(&self, tunnel: &Tunnel, target: TunnelState) -> TunnelResult<TunnelState> {
        let name = tunnel.name();
        let op = match target {
            TunnelState::Up => "activate",
            TunnelState::Down => "deactivate",
        };
        let backend = self.backend.clone();
        let t = tunnel.clone();
        self.worker
            .try_run(async move { backend.set_state(&t, target).await }, |e| {
                TunnelError::backend(op, &name, e)
            })
            .await
    }

    /// Bring a tunnel back up, loading its configuration first if needed.
    async fn reactivate(&self, tunnel: &Tunnel) -> TunnelResult<()> {
        self.ensure_config(tunnel).await?;
        let state = self.backend_set_state(tunnel, TunnelState::Up).await?;
        self.update_state(tunnel, state);
        Ok(())
    }

    async fn fetch_config(&self, tunnel: &Tunnel) -> TunnelResult<TunnelConfig> {
        let name = tunnel.name();
        let store = self.config_store.clone();
        let key = name.clone();
        let config = self
            .worker
            .try_run(async move { store.load(&key).await }, |e| {
                TunnelError::config_store("load", &name, e)
            })
            .await?;
        tunnel.set_config(config.clone());
        self.emit(TunnelEvent::ConfigChanged { name });
        Ok(config)
    }

    async fn ensure_config(&self, tunnel: &Tunnel) -> TunnelResult<TunnelConfig> {
        match tunnel.config() {
            Some(config) => Ok(config),
            None => self.fetch_config(tunnel).await,
        }
    }

    async fn save_state(&self) -> TunnelResult<()> {
        let _guard = self.save_lock.lock().await;
        let running = self.registry.lock().running_names();
        debug!(running = ?running, "Saving running tunnels");
        let store = self.state_store.clone();
        self.worker
            .try_run(async move { store.set_running_tunnels(&running).await }, |e| {
                TunnelError::state_store("write running tunnels", e)
            })
            .await
    }

    /// Rewrite the running set if the tunnel was up or any of its names
    /// appear in the persisted set, so it never keeps a stale entry.
    async fn save_state_if_affected(&self, names: &[&str], was_up: bool) -> TunnelResult<()> {
        let affected = was_up || {
            let store = self.state_store.clone();
            match self
                .worker
                .try_run(async move { store.running_tunnels().await }, |e| {
                    TunnelError::state_store("read running tunnels", e)
                })
                .await
            {
                Ok(Some(running)) => names.iter().any(|n| running.contains(*n)),
                Ok(None) => false,
                Err(e) => {
                    warn!(error = %e, "Could not read running tunnels; rewriting them");
                    true
                }
            }
        };
        if affected {
            self.save_state().await
        } else {
            Ok(())
        }
    }

    async fn load(self: Arc<Self>) -> TunnelResult<()> {
        let (present, running) = match tokio::try_join!(self.store_enumerate(), self.backend_enumerate()) {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "Failed to load tunnels");
                self.readiness.lock().loading = false;
                return Err(e);
            }
        };

        {
            let mut registry = self.registry.lock();
            for name in &present {
                let state = TunnelState::from_active(running.contains(name));
                registry.insert(Tunnel::new(name.clone(), None, state));
            }
        }
        for name in &present {
            self.emit(TunnelEvent::Added { name: name.clone() });
        }

        let store = self.state_store.clone();
        let last_used = self
            .worker
            .try_run(async move { store.last_used().await }, |e| {
                TunnelError::state_store("read last used tunnel", e)
            })
            .await;
        match last_used {
            Ok(Some(name)) => {
                let found = self.registry.lock().get(&name);
                match found {
                    Some(tunnel) => {
                        self.registry.lock().set_last_used(Some(tunnel));
                        self.emit(TunnelEvent::LastUsedChanged { name: Some(name) });
                    }
                    None => debug!(tunnel = %name, "Last used tunnel no longer exists"),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read last used tunnel"),
        }

        let delayed = {
            let mut readiness = self.readiness.lock();
            readiness.loaded = true;
            readiness.loading = false;
            std::mem::take(&mut readiness.delayed)
        };
        self.ready.send_replace(true);
        info!(
            count = present.len(),
            running = running.len(),
            "Tunnel registry loaded"
        );

        if !delayed.is_empty() {
            let inner = self.clone();
            tokio::spawn(async move {
                let result = inner.restore_running().await;
                for tx in delayed {
                    let _ = tx.send(result.clone());
                }
            });
        }
        Ok(())
    }

    async fn store_enumerate(&self) -> TunnelResult<std::collections::BTreeSet<String>> {
        let store = self.config_store.clone();
        self.worker
            .try_run(async move { store.enumerate().await }, |e| {
                TunnelError::config_store("enumerate", "*", e)
            })
            .await
    }

    async fn restore_running(self: &Arc<Self>) -> TunnelResult<()> {
        let store = self.state_store.clone();
        let previously_running = self
            .worker
            .try_run(async move { store.running_tunnels().await }, |e| {
                TunnelError::state_store("read running tunnels", e)
            })
            .await?;
        let Some(previously_running) = previously_running else {
            debug!("No running tunnels recorded; nothing to restore");
            return Ok(());
        };

        let targets: Vec<Tunnel> = self
            .registry
            .lock()
            .tunnels()
            .into_iter()
            .filter(|t| previously_running.contains(&t.name()))
            .collect();
        info!(count = targets.len(), "Restoring previously running tunnels");

        let results = join_all(targets.into_iter().map(|tunnel| {
            let inner = self.clone();
            async move { inner.set_state(tunnel, TunnelState::Up).await }
        }))
        .await;
        collect_failures("restore", results)
    }

    async fn create(&self, name: String, config: TunnelConfig) -> TunnelResult<Tunnel> {
        let store = self.config_store.clone();
        let key = name.clone();
        let saved = self
            .worker
            .try_run(async move { store.create(&key, config).await }, |e| {
                TunnelError::config_store("create", &name, e)
            })
            .await?;

        let tunnel = Tunnel::new(name.clone(), Some(saved), TunnelState::Down);
        self.registry.lock().insert(tunnel.clone());
        info!(tunnel = %name, "Tunnel created");
        self.emit(TunnelEvent::Added { name });
        Ok(tunnel)
    }

    async fn delete(self: Arc<Self>, tunnel: Tunnel) -> TunnelResult<()> {
        let _lock = self.lock_tunnel(&tunnel).await?;
        let name = tunnel.name();
        let original_state = tunnel.state();

        let was_last_used = self.registry.lock().is_last_used(&tunnel);
        if was_last_used {
            self.set_last_used(None).await?;
        }
        let reservation = Reservation::withdraw(&self.registry, &tunnel)?;
        self.emit(TunnelEvent::Removed { name: name.clone() });
        info!(tunnel = %name, state = %original_state, "Deleting tunnel");

        let result = self.delete_tail(&tunnel, &name, original_state).await;
        match &result {
            Ok(()) => info!(tunnel = %name, "Tunnel deleted"),
            Err(e) => {
                warn!(tunnel = %name, error = %e, "Delete failed; restoring tunnel");
                self.reinsert(&tunnel);
                if was_last_used {
                    if let Err(e) = self.set_last_used(Some(&tunnel)).await {
                        warn!(tunnel = %name, error = %e, "Could not restore last used tunnel");
                    }
                }
            }
        }
        drop(reservation);

        let saved = self
            .save_state_if_affected(&[name.as_str()], original_state.is_up())
            .await;
        result.and(saved)
    }

    async fn delete_tail(&self, tunnel: &Tunnel, name: &str, original_state: TunnelState) -> TunnelResult<()> {
        if original_state.is_up() {
            let state = self.backend_set_state(tunnel, TunnelState::Down).await?;
            self.update_state(tunnel, state);
        }

        let store = self.config_store.clone();
        let key = name.to_string();
        let deleted = self
            .worker
            .try_run(async move { store.delete(&key).await }, |e| {
                TunnelError::config_store("delete", name, e)
            })
            .await;

        let Err(cause) = deleted else {
            return Ok(());
        };
        if original_state.is_up() {
            if let Err(rollback) = self.reactivate(tunnel).await {
                return Err(TunnelError::Inconsistent {
                    op: "delete",
                    tunnel: name.to_string(),
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                });
            }
        }
        Err(cause)
    }

    async fn rename(self: Arc<Self>, tunnel: Tunnel, new_name: String) -> TunnelResult<String> {
        let _old_lock = self.lock_tunnel(&tunnel).await?;
        let old_name = tunnel.name();
        let target = Reservation::new_name(&self.registry, &new_name)?;
        let _new_lock = self.locks.lock(&new_name).await;

        let original_state = tunnel.state();
        let was_last_used = self.registry.lock().is_last_used(&tunnel);
        if was_last_used {
            self.set_last_used(None).await?;
        }
        let reservation = Reservation::withdraw(&self.registry, &tunnel)?.merge(target);
        self.emit(TunnelEvent::Removed {
            name: old_name.clone(),
        });
        info!(tunnel = %old_name, new_name = %new_name, state = %original_state, "Renaming tunnel");

        let result = self
            .rename_tail(&tunnel, &old_name, &new_name, original_state)
            .await;
        if let Err(e) = &result {
            warn!(tunnel = %old_name, error = %e, "Rename failed; re-reading tunnel state");
            // The backend may have been left anywhere; trust only a fresh read.
            match self.backend_get_state(&tunnel).await {
                Ok(state) => self.update_state(&tunnel, state),
                Err(e) => warn!(tunnel = %tunnel.name(), error = %e, "Could not re-read tunnel state"),
            }
        }

        let final_name = tunnel.name();
        self.reinsert(&tunnel);
        if final_name != old_name {
            self.emit(TunnelEvent::Renamed {
                from: old_name.clone(),
                to: final_name.clone(),
            });
        }
        drop(reservation);
        if was_last_used {
            if let Err(e) = self.set_last_used(Some(&tunnel)).await {
                warn!(tunnel = %final_name, error = %e, "Could not restore last used tunnel");
            }
        }

        let saved = self
            .save_state_if_affected(
                &[old_name.as_str(), new_name.as_str()],
                original_state.is_up() || tunnel.state().is_up(),
            )
            .await;
        result.and(saved).map(|_| final_name)
    }

    async fn rename_tail(
        &self,
        tunnel: &Tunnel,
        old_name: &str,
        new_name: &str,
        original_state: TunnelState,
    ) -> TunnelResult<()> {
        if original_state.is_up() {
            let state = self.backend_set_state(tunnel, TunnelState::Down).await?;
            self.update_state(tunnel, state);
        }

        let store = self.config_store.clone();
        let (from, to) = (old_name.to_string(), new_name.to_string());
        let renamed = self
            .worker
            .try_run(async move { store.rename(&from, &to).await }, |e| {
                TunnelError::config_store("rename", old_name, e)
            })
            .await;

        if let Err(cause) = renamed {
            if original_state.is_up() {
                if let Err(rollback) = self.reactivate(tunnel).await {
                    return Err(TunnelError::Inconsistent {
                        op: "rename",
                        tunnel: old_name.to_string(),
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    });
                }
            }
            return Err(cause);
        }

        tunnel.set_name(new_name.to_string());
        if original_state.is_up() {
            self.reactivate(tunnel).await?;
        }
        Ok(())
    }

    async fn set_state(self: Arc<Self>, tunnel: Tunnel, target: TunnelState) -> TunnelResult<TunnelState> {
        let _lock = self.lock_tunnel(&tunnel).await?;
        let name = tunnel.name();
        let prior = tunnel.state();

        let result = match self.ensure_config(&tunnel).await {
            Ok(_) => self.backend_set_state(&tunnel, target).await,
            Err(e) => Err(e),
        };
        // Record the outcome whether or not the call worked.
        let observed = match &result {
            Ok(state) => *state,
            Err(e) => {
                warn!(tunnel = %name, target = %target, error = %e, "State change failed");
                prior
            }
        };
        self.update_state(&tunnel, observed);

        if matches!(result, Ok(TunnelState::Up)) {
            if let Err(e) = self.set_last_used(Some(&tunnel)).await {
                warn!(tunnel = %name, error = %e, "Could not record last used tunnel");
            }
        }
        let saved = self.save_state().await;
        match result {
            Ok(state) => {
                info!(tunnel = %name, state = %state, "Tunnel state changed");
                saved.map(|_| state)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_config(&self, tunnel: &Tunnel, config: TunnelConfig) -> TunnelResult<TunnelConfig> {
        let name = tunnel.name();
        let backend = self.backend.clone();
        let t = tunnel.clone();
        let applied = self
            .worker
            .try_run(async move { backend.apply_config(&t, config).await }, |e| {
                TunnelError::backend("apply config to", &name, e)
            })
            .await?;

        let store = self.config_store.clone();
        let key = name.clone();
        let saved = self
            .worker
            .try_run(async move { store.save(&key, applied).await }, |e| {
                TunnelError::config_store("save", &name, e)
            })
            .await?;
        tunnel.set_config(saved.clone());
        info!(tunnel = %name, "Tunnel configuration updated");
        self.emit(TunnelEvent::ConfigChanged { name });
        Ok(saved)
    }
}
