//! Local JSON-file key-value store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::store::{KeyValueStore, StoreChange};
use blocksync_common::{Error, Result};

const CHANGE_FEED_CAPACITY: usize = 64;

/// Local filesystem key-value store.
///
/// Keeps the whole map in memory and rewrites a single JSON object file on
/// every change. Writes land in a temporary sibling first and are renamed
/// into place.
pub struct LocalStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Open the store file, creating parent directories as needed.
    ///
    /// # Postconditions
    /// - A missing file yields an empty store; nothing is written until the
    ///   first change
    ///
    /// # Errors
    /// - Permission denied
    /// - File exists but is not a JSON object
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let values = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    Error::Storage(format!("Corrupt store file {}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened store {} with {} keys", path.display(), values.len());

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(values)?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    fn publish(&self, key: &str, new_value: Option<Value>) {
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            new_value,
        });
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.get(key) == Some(&value) {
            return Ok(());
        }

        let previous = values.insert(key.to_string(), value.clone());
        if let Err(e) = self.persist(&values).await {
            match previous {
                Some(previous) => values.insert(key.to_string(), previous),
                None => values.remove(key),
            };
            return Err(e);
        }
        drop(values);

        self.publish(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        let Some(previous) = values.remove(key) else {
            return Ok(());
        };

        if let Err(e) = self.persist(&values).await {
            values.insert(key.to_string(), previous);
            return Err(e);
        }
        drop(values);

        self.publish(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
