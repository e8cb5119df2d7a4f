use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::error;

use super::{StateStore, StoreResult};

/// Manager state as written to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, rename = "last_used_tunnel")]
    pub last_used: Option<String>,
    #[serde(default)]
    pub restore_on_boot: bool,
    #[serde(default, rename = "enabled_configs")]
    pub running: Option<BTreeSet<String>>,
}

/// JSON file holding [`PersistedState`], cached in memory and flushed on
/// every write.
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl JsonStateStore {
    /// Open the store, starting empty if the file is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::read(&path).await.unwrap_or_default();
        JsonStateStore {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(path: &Path) -> Option<PersistedState> {
        let contents = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!(file = %path.display(), "failed to read state file: {err}");
                }
                return None;
            }
        };

        match serde_json::from_slice::<PersistedState>(&contents) {
            Ok(state) => Some(state),
            Err(err) => {
                error!(file = %path.display(), "failed to parse state file: {err}");
                None
            }
        }
    }

    async fn update(&self, apply: impl FnOnce(&mut PersistedState)) -> StoreResult<()> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        apply(&mut next);
        if next == *guard {
            return Ok(());
        }
        self.flush(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn flush(&self, state: &PersistedState) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Copy of the cached state.
    pub async fn snapshot(&self) -> PersistedState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn last_used(&self) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.last_used.clone())
    }

    async fn set_last_used(&self, name: Option<&str>) -> StoreResult<()> {
        let name = name.map(str::to_string);
        self.update(|s| s.last_used = name).await
    }

    async fn restore_on_boot(&self) -> StoreResult<bool> {
        Ok(self.state.lock().await.restore_on_boot)
    }

    async fn set_restore_on_boot(&self, enabled: bool) -> StoreResult<()> {
        self.update(|s| s.restore_on_boot = enabled).await
    }

    async fn running_tunnels(&self) -> StoreResult<Option<BTreeSet<String>>> {
        Ok(self.state.lock().await.running.clone())
    }

    async fn set_running_tunnels(&self, names: &BTreeSet<String>) -> StoreResult<()> {
        let names = names.clone();
        self.update(|s| s.running = Some(names)).await
    }
}
