//! Key-value store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use blocksync_common::Result;

/// Keys of the persisted records.
pub mod keys {
    /// Sequence of blocked identity strings.
    pub const BLOCKED_USERS: &str = "blockedUsers";
    /// API key string, absent when offline.
    pub const API_KEY: &str = "apiKey";
    /// Sync bookkeeping record.
    pub const SYNC_STATE: &str = "syncState";
}

/// Notification published when a stored value changes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    /// Key that changed.
    pub key: String,
    /// New value, `None` when the key was removed.
    pub new_value: Option<Value>,
}

/// Durable string-keyed store of JSON values.
///
/// Implementations must serialize their own writes; callers that need a
/// read-modify-write cycle to be atomic hold their own lock around it.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// # Returns
    /// `None` if the key has never been set or was removed.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one.
    ///
    /// # Postconditions
    /// - A `StoreChange` is published if the stored value changed
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Typed access on top of the raw JSON contract.
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and deserialize a value.
    async fn get_typed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a value.
    async fn set_typed<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
