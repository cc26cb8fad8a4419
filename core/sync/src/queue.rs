//! Durable queue of unconfirmed remote mutations.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use blocksync_common::{Identity, Result};
use blocksync_storage::KeyValueStore;

use crate::state::{OperationType, PendingOperation, SyncStateStore};

/// Partial update for a queued operation. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPatch {
    pub retry_count: Option<u32>,
    pub next_retry_time: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

impl OperationPatch {
    /// Patch recording a failed attempt.
    pub fn failed_attempt(
        retry_count: u32,
        next_retry_time: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            retry_count: Some(retry_count),
            next_retry_time: Some(Some(next_retry_time)),
            last_error: Some(Some(error.into())),
        }
    }

    fn apply(self, op: &mut PendingOperation) {
        if let Some(retry_count) = self.retry_count {
            op.retry_count = retry_count;
        }
        if let Some(next_retry_time) = self.next_retry_time {
            op.next_retry_time = next_retry_time;
        }
        if let Some(last_error) = self.last_error {
            op.last_error = last_error;
        }
    }
}

/// Add/remove/update/list contract over `SyncState.pendingOperations`.
///
/// Entries are keyed by (identity, type); adding an existing pair is a
/// no-op. Each call is atomic with respect to other state writers.
pub struct PendingQueue<S: KeyValueStore + ?Sized> {
    state: Arc<SyncStateStore<S>>,
}

impl<S: KeyValueStore + ?Sized> Clone for PendingQueue<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized> PendingQueue<S> {
    pub fn new(state: Arc<SyncStateStore<S>>) -> Self {
        Self { state }
    }

    /// Enqueue an operation.
    ///
    /// # Returns
    /// `true` if inserted, `false` if the pair was already queued.
    pub async fn add(&self, operation: PendingOperation) -> Result<bool> {
        Ok(self.add_many(vec![operation]).await? == 1)
    }

    /// Enqueue several operations in one write.
    ///
    /// # Returns
    /// Number of operations actually inserted.
    pub async fn add_many(&self, operations: Vec<PendingOperation>) -> Result<usize> {
        self.state
            .update(move |state| {
                let mut inserted = 0;
                for operation in operations {
                    let exists = state
                        .pending_operations
                        .iter()
                        .any(|op| op.matches(&operation.identity, operation.op_type));
                    if !exists {
                        debug!("Queued {} for {}", operation.op_type, operation.identity);
                        state.pending_operations.push(operation);
                        inserted += 1;
                    }
                }
                inserted
            })
            .await
    }

    /// Remove the operation for a pair.
    ///
    /// # Returns
    /// `true` if an operation was removed.
    pub async fn remove(&self, identity: &Identity, op_type: OperationType) -> Result<bool> {
        self.state
            .update(|state| {
                let before = state.pending_operations.len();
                state
                    .pending_operations
                    .retain(|op| !op.matches(identity, op_type));
                state.pending_operations.len() != before
            })
            .await
    }

    /// Apply a partial patch to the operation for a pair.
    ///
    /// # Returns
    /// `true` if a matching operation was found.
    pub async fn update(
        &self,
        identity: &Identity,
        op_type: OperationType,
        patch: OperationPatch,
    ) -> Result<bool> {
        self.state
            .update(|state| {
                match state
                    .pending_operations
                    .iter_mut()
                    .find(|op| op.matches(identity, op_type))
                {
                    Some(op) => {
                        patch.apply(op);
                        true
                    }
                    None => false,
                }
            })
            .await
    }

    /// Snapshot of all queued operations, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.state.load().await?.pending_operations)
    }

    /// Keep only operations for which `keep` returns true.
    ///
    /// # Returns
    /// Number of operations dropped.
    pub async fn retain<F>(&self, keep: F) -> Result<usize>
    where
        F: Fn(&PendingOperation) -> bool + Send,
    {
        self.state
            .update(move |state| {
                let before = state.pending_operations.len();
                state.pending_operations.retain(|op| keep(op));
                before - state.pending_operations.len()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_storage::MemoryStore;
    use proptest::prelude::*;

    fn queue() -> PendingQueue<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        PendingQueue::new(Arc::new(SyncStateStore::new(store)))
    }

    fn op(op_type: OperationType, name: &str) -> PendingOperation {
        PendingOperation::new(op_type, Identity::new(name).unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn test_add_is_deduplicated() {
        let queue = queue();

        assert!(queue.add(op(OperationType::Block, "alice")).await.unwrap());
        assert!(!queue.add(op(OperationType::Block, "alice")).await.unwrap());
        assert!(queue.add(op(OperationType::Unblock, "alice")).await.unwrap());

        assert_eq!(queue.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_matches_pair() {
        let queue = queue();
        queue.add(op(OperationType::Block, "alice")).await.unwrap();
        queue.add(op(OperationType::Unblock, "alice")).await.unwrap();

        let alice = Identity::new("alice").unwrap();
        assert!(queue.remove(&alice, OperationType::Block).await.unwrap());
        assert!(!queue.remove(&alice, OperationType::Block).await.unwrap());

        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].op_type, OperationType::Unblock);
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let queue = queue();
        queue.add(op(OperationType::Block, "bob")).await.unwrap();

        let bob = Identity::new("bob").unwrap();
        // Stored with millisecond precision.
        let next = DateTime::from_timestamp_millis(1_700_003_600_123).unwrap();
        let found = queue
            .update(
                &bob,
                OperationType::Block,
                OperationPatch::failed_attempt(1, next, "Network error: down"),
            )
            .await
            .unwrap();
        assert!(found);

        let updated = &queue.list().await.unwrap()[0];
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.next_retry_time, Some(next));
        assert_eq!(updated.last_error.as_deref(), Some("Network error: down"));

        let missing = queue
            .update(&bob, OperationType::Unblock, OperationPatch::default())
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn test_concurrent_adds_keep_one_entry() {
        let queue = queue();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.add(op(OperationType::Block, "carol")).await })
            })
            .collect();

        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retain_reports_dropped() {
        let queue = queue();
        queue
            .add_many(vec![
                op(OperationType::Block, "a"),
                op(OperationType::Block, "b"),
                op(OperationType::Unblock, "c"),
            ])
            .await
            .unwrap();

        let dropped = queue
            .retain(|op| op.op_type == OperationType::Block)
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(queue.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retain_from_spawned_task() {
        let queue = Arc::new(queue());
        queue
            .add_many(vec![
                op(OperationType::Block, "a"),
                op(OperationType::Unblock, "b"),
            ])
            .await
            .unwrap();

        let keep = Identity::new("a").unwrap();
        let task_queue = queue.clone();
        let dropped = tokio::spawn(async move {
            task_queue.retain(move |op| op.identity == keep).await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(dropped, 1);
        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].identity.as_str(), "a");
    }

    proptest! {
        #[test]
        fn queue_never_holds_duplicate_pairs(
            names in proptest::collection::vec(("[a-d]", any::<bool>()), 0..24)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let ops = runtime.block_on(async {
                let queue = queue();
                for (name, block) in &names {
                    let op_type = if *block { OperationType::Block } else { OperationType::Unblock };
                    queue.add(op(op_type, name)).await.unwrap();
                }
                queue.list().await.unwrap()
            });

            let mut pairs: Vec<_> = ops.iter().map(|o| (o.identity.clone(), o.op_type)).collect();
            let total = pairs.len();
            pairs.sort_by(|a, b| a.0.cmp(&b.0).then((a.1 as u8).cmp(&(b.1 as u8))));
            pairs.dedup();
            prop_assert_eq!(pairs.len(), total);
        }
    }
}
