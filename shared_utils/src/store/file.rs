//! Directory-backed configuration store.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{ConfigStore, StoreError, StoreResult};
use crate::tunnel::TunnelConfig;

const CONFIG_EXTENSION: &str = "conf";

/// Stores each tunnel as `<dir>/<name>.conf`.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileConfigStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{CONFIG_EXTENSION}"))
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(fs::try_exists(self.path(name)).await?)
    }

    /// Write through a temporary file so a crash never leaves a torn config.
    async fn write(&self, name: &str, config: &TunnelConfig) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{name}.{CONFIG_EXTENSION}.tmp"));
        fs::write(&tmp, config.as_str()).await?;
        fs::rename(&tmp, self.path(name)).await?;
        Ok(())
    }
}

fn not_found(err: std::io::Error, name: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn enumerate(&self) -> StoreResult<BTreeSet<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONFIG_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if !stem.starts_with('.') => {
                    names.insert(stem.to_string());
                }
                _ => warn!(file = %path.display(), "Skipping unreadable config file name"),
            }
        }
        debug!(dir = %self.dir.display(), count = names.len(), "Enumerated stored configs");
        Ok(names)
    }

    async fn create(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig> {
        if self.exists(name).await? {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        self.write(name, &config).await?;
        Ok(config)
    }

    async fn load(&self, name: &str) -> StoreResult<TunnelConfig> {
        let text = fs::read_to_string(self.path(name))
            .await
            .map_err(|e| not_found(e, name))?;
        Ok(TunnelConfig::new(text))
    }

    async fn save(&self, name: &str, config: TunnelConfig) -> StoreResult<TunnelConfig> {
        if !self.exists(name).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.write(name, &config).await?;
        Ok(config)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        fs::remove_file(self.path(name))
            .await
            .map_err(|e| not_found(e, name))
    }

    async fn rename(&self, old: &str, new: &str) -> StoreResult<()> {
        if self.exists(new).await? {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        fs::rename(self.path(old), self.path(new))
            .await
            .map_err(|e| not_found(e, old))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_load_save() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("configs"));

        assert!(store.enumerate().await.unwrap().is_empty());

        store.create("wg0", TunnelConfig::new("v1")).await.unwrap();
        assert!(matches!(
            store.create("wg0", TunnelConfig::new("v2")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.load("wg0").await.unwrap().as_str(), "v1");

        store.save("wg0", TunnelConfig::new("v2")).await.unwrap();
        assert_eq!(store.load("wg0").await.unwrap().as_str(), "v2");
        assert!(matches!(
            store.save("missing", TunnelConfig::new("v1")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enumerate_ignores_other_files() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        store.create("b", TunnelConfig::new("")).await.unwrap();
        store.create("a", TunnelConfig::new("")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join(".c.conf.tmp"), "x").unwrap();

        let names: Vec<_> = store.enumerate().await.unwrap().into_iter().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        store.create("wg0", TunnelConfig::new("cfg")).await.unwrap();
        store.create("wg1", TunnelConfig::new("other")).await.unwrap();

        assert!(matches!(
            store.rename("wg0", "wg1").await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.rename("nope", "wg9").await,
            Err(StoreError::NotFound(_))
        ));

        store.rename("wg0", "home").await.unwrap();
        assert_eq!(store.load("home").await.unwrap().as_str(), "cfg");
        assert!(matches!(store.load("wg0").await, Err(StoreError::NotFound(_))));

        store.delete("home").await.unwrap();
        assert!(matches!(store.delete("home").await, Err(StoreError::NotFound(_))));
    }
}
