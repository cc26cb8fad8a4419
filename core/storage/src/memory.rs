//! In-memory key-value store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::store::{KeyValueStore, StoreChange};
use blocksync_common::{Error, Result};

/// Capacity of the change feed before slow subscribers start lagging.
const CHANGE_FEED_CAPACITY: usize = 64;

/// In-memory key-value store.
///
/// Useful for testing and for hosts that persist elsewhere. All data is
/// stored in memory and lost on drop.
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Value>>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Create a store pre-populated with values. No changes are published.
    pub fn with_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.values.write() {
            map.extend(values);
        }
        store
    }

    fn publish(&self, key: &str, new_value: Option<Value>) {
        // No subscribers is fine.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Storage("Memory store lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.read().map_err(|_| poisoned())?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let changed = {
            let mut values = self.values.write().map_err(|_| poisoned())?;
            let changed = values.get(key) != Some(&value);
            values.insert(key.to_string(), value.clone());
            changed
        };

        if changed {
            self.publish(key, Some(value));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut values = self.values.write().map_err(|_| poisoned())?;
            values.remove(key).is_some()
        };

        if removed {
            self.publish(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new();
        store.set("apiKey", json!("k-123")).await.unwrap();

        assert_eq!(store.get("apiKey").await.unwrap(), Some(json!("k-123")));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store.set("apiKey", json!("k-123")).await.unwrap();
        store.remove("apiKey").await.unwrap();
        store.remove("apiKey").await.unwrap();

        assert_eq!(store.get("apiKey").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_change_feed() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set("blockedUsers", json!(["alice"])).await.unwrap();
        store.remove("blockedUsers").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "blockedUsers");
        assert_eq!(first.new_value, Some(json!(["alice"])));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.new_value, None);
    }

    #[tokio::test]
    async fn test_unchanged_write_is_silent() {
        let store = MemoryStore::new();
        store.set("blockedUsers", json!(["alice"])).await.unwrap();

        let mut rx = store.subscribe();
        store.set("blockedUsers", json!(["alice"])).await.unwrap();
        store.remove("never-set").await.unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_with_values() {
        let store = MemoryStore::with_values([("apiKey".to_string(), json!("k"))]);
        assert_eq!(store.get("apiKey").await.unwrap(), Some(json!("k")));
    }
}
