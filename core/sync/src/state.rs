//! Sync state tracking and persistence.

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use blocksync_common::{Identity, Result};
use blocksync_storage::{keys, KeyValueStore, KeyValueStoreExt};

/// Kind of remote mutation awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Block,
    Unblock,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Block => write!(f, "block"),
            OperationType::Unblock => write!(f, "unblock"),
        }
    }
}

/// A remote mutation that has not been confirmed yet.
///
/// At most one operation exists per (identity, type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(alias = "username")]
    pub identity: Identity,
    #[serde(with = "ts_milliseconds", alias = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Failed retry attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Earliest time a scheduled drain may attempt this again.
    #[serde(default, with = "ts_milliseconds_option")]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Create a fresh operation, eligible for the next drain.
    pub fn new(op_type: OperationType, identity: Identity, created_at: DateTime<Utc>) -> Self {
        Self {
            op_type,
            identity,
            created_at,
            retry_count: 0,
            next_retry_time: None,
            last_error: None,
        }
    }

    /// Whether this operation targets the given pair.
    pub fn matches(&self, identity: &Identity, op_type: OperationType) -> bool {
        self.op_type == op_type && &self.identity == identity
    }

    /// Retries exhausted; kept visible but no longer attempted automatically.
    pub fn is_abandoned(&self, max_attempts: u32) -> bool {
        self.retry_count >= max_attempts
    }

    /// Whether a scheduled drain should wait before attempting this.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time.is_some_and(|at| at > now)
    }
}

/// Sync bookkeeping persisted under `syncState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    #[serde(with = "ts_milliseconds_option")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_success: Option<bool>,
    pub last_sync_error: Option<String>,
    pub pending_operations: Vec<PendingOperation>,
}

impl SyncState {
    /// Create a new empty sync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed remote round trip.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_sync_time = Some(at);
        self.last_sync_success = Some(true);
        self.last_sync_error = None;
    }

    /// Record a failed sync pass without touching `last_sync_time`.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_sync_success = Some(false);
        self.last_sync_error = Some(error.into());
    }

    /// Counts for status displays.
    pub fn status_summary(&self, max_attempts: u32) -> StatusSummary {
        let failed = self
            .pending_operations
            .iter()
            .filter(|op| op.is_abandoned(max_attempts))
            .count();
        StatusSummary {
            last_sync_time: self.last_sync_time,
            last_sync_success: self.last_sync_success,
            last_sync_error: self.last_sync_error.clone(),
            pending: self.pending_operations.len() - failed,
            failed,
        }
    }
}

/// UI-facing summary of the sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    #[serde(with = "ts_milliseconds_option")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_success: Option<bool>,
    pub last_sync_error: Option<String>,
    /// Operations still being retried.
    pub pending: usize,
    /// Operations that exhausted their retries.
    pub failed: usize,
}

/// Single-writer handle over the persisted `SyncState`.
///
/// Every mutation is a read-modify-write under one lock, so concurrent
/// callers never lose each other's updates.
pub struct SyncStateStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    lock: Mutex<()>,
}

impl<S: KeyValueStore + ?Sized> SyncStateStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Read the current state. A missing record yields the default state.
    pub async fn load(&self) -> Result<SyncState> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Apply `f` to the state and persist the result if it changed.
    pub async fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SyncState) -> T + Send,
        T: Send,
    {
        let _guard = self.lock.lock().await;
        let before = self.read().await?;
        let mut after = before.clone();
        let result = f(&mut after);

        if after != before {
            self.store.set_typed(keys::SYNC_STATE, &after).await?;
        }
        Ok(result)
    }

    async fn read(&self) -> Result<SyncState> {
        match self.store.get_typed::<SyncState>(keys::SYNC_STATE).await {
            Ok(state) => Ok(state.unwrap_or_default()),
            Err(blocksync_common::Error::Serialization(e)) => {
                warn!("Discarding unreadable sync state: {}", e);
                Ok(SyncState::default())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_storage::MemoryStore;
    use serde_json::json;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_operation_lifecycle_flags() {
        let now = Utc::now();
        let mut op = PendingOperation::new(OperationType::Block, id("alice"), now);
        assert!(!op.is_deferred(now));
        assert!(!op.is_abandoned(3));

        op.retry_count = 3;
        op.next_retry_time = Some(now + chrono::Duration::hours(1));
        assert!(op.is_deferred(now));
        assert!(op.is_abandoned(3));
        assert!(op.matches(&id("alice"), OperationType::Block));
        assert!(!op.matches(&id("alice"), OperationType::Unblock));
    }

    #[test]
    fn test_persisted_shape() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let mut state = SyncState::new();
        state.record_success(at);
        state
            .pending_operations
            .push(PendingOperation::new(OperationType::Unblock, id("bob"), at));

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            json!({
                "lastSyncTime": 1_700_000_000_000i64,
                "lastSyncSuccess": true,
                "lastSyncError": null,
                "pendingOperations": [{
                    "type": "unblock",
                    "identity": "bob",
                    "createdAt": 1_700_000_000_000i64,
                    "retryCount": 0,
                    "nextRetryTime": null,
                    "lastError": null
                }]
            })
        );
    }

    #[test]
    fn test_reads_legacy_operation_fields() {
        let state: SyncState = serde_json::from_value(json!({
            "lastSyncTime": null,
            "pendingOperations": [{
                "type": "block",
                "username": "carol",
                "timestamp": 1_700_000_000_000i64,
                "retryCount": 1
            }]
        }))
        .unwrap();

        let op = &state.pending_operations[0];
        assert_eq!(op.identity.as_str(), "carol");
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.next_retry_time, None);
        assert_eq!(state.last_sync_success, None);
    }

    #[test]
    fn test_status_summary() {
        let now = Utc::now();
        let mut state = SyncState::new();
        let mut stale = PendingOperation::new(OperationType::Block, id("a"), now);
        stale.retry_count = 3;
        state.pending_operations.push(stale);
        state
            .pending_operations
            .push(PendingOperation::new(OperationType::Block, id("b"), now));
        state.record_failure("Failed to upload 1 users");

        let summary = state.status_summary(3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.last_sync_success, Some(false));
    }

    #[tokio::test]
    async fn test_update_persists() {
        let store = Arc::new(MemoryStore::new());
        let states = SyncStateStore::new(store.clone());

        states
            .update(|s| s.record_failure("boom"))
            .await
            .unwrap();

        let reloaded = SyncStateStore::new(store).load().await.unwrap();
        assert_eq!(reloaded.last_sync_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unchanged_update_does_not_write() {
        let store = Arc::new(MemoryStore::new());
        let states = SyncStateStore::new(store.clone());

        states.update(|_| ()).await.unwrap();
        assert_eq!(store.get(keys::SYNC_STATE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_state_resets() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::SYNC_STATE, json!("garbage")).await.unwrap();

        let state = SyncStateStore::new(store).load().await.unwrap();
        assert_eq!(state, SyncState::default());
    }
}
