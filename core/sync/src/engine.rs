//! Reconciliation engine that orchestrates all sync operations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use blocksync_common::{Credential, Error, Identity, Result};
use blocksync_remote::{ConnectionCheck, RemoteList};
use blocksync_storage::{keys, KeyValueStore, KeyValueStoreExt};

use crate::cache::{BlockedSet, LocalCache, MergePlan};
use crate::clock::{Clock, SystemClock};
use crate::queue::{OperationPatch, PendingQueue};
use crate::report::{
    ClearOutcome, DrainReport, ManualSyncReport, MutationOutcome, SkipReason, SyncOutcome,
    SyncReport,
};
use crate::retry::{classify_attempt, AttemptOutcome, BackoffSchedule};
use crate::scheduler::{SyncMode, SyncRequest, SyncResponse};
use crate::state::{OperationType, PendingOperation, StatusSummary, SyncState, SyncStateStore};

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Waits between retries of a queued operation.
    pub backoff: BackoffSchedule,
    /// Seconds between scheduled full syncs. Zero disables them.
    pub full_sync_interval_secs: u64,
    /// Seconds between scheduled queue drains. Zero disables them.
    pub drain_interval_secs: u64,
    /// Seconds before the first scheduled pass.
    pub initial_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffSchedule::default(),
            full_sync_interval_secs: 24 * 60 * 60,
            drain_interval_secs: 30 * 60,
            initial_delay_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Scheduler mode matching the configured intervals.
    pub fn sync_mode(&self) -> SyncMode {
        if self.full_sync_interval_secs == 0 && self.drain_interval_secs == 0 {
            return SyncMode::Manual;
        }
        SyncMode::Periodic {
            full_sync_interval: Duration::from_secs(self.full_sync_interval_secs),
            drain_interval: Duration::from_secs(self.drain_interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
        }
    }
}

/// Keeps the local blocked list and the remote list consistent.
///
/// Every sync pass (full, initial, drain, manual) holds `sync_guard` for its
/// whole duration, so at most one reconciliation touches the cache and
/// queue at a time. Optimistic mutations do not take the guard; the cache
/// and queue serialize their own writes.
pub struct ReconciliationEngine<S: KeyValueStore + ?Sized, R: RemoteList + ?Sized> {
    store: Arc<S>,
    remote: Arc<R>,
    cache: LocalCache<S>,
    state: Arc<SyncStateStore<S>>,
    queue: PendingQueue<S>,
    clock: Arc<dyn Clock>,
    sync_guard: Mutex<()>,
    config: SyncConfig,
}

impl<S: KeyValueStore + ?Sized, R: RemoteList + ?Sized> ReconciliationEngine<S, R> {
    /// Create an engine over a store and a remote, using the system clock.
    pub fn new(store: Arc<S>, remote: Arc<R>, config: SyncConfig) -> Self {
        let state = Arc::new(SyncStateStore::new(store.clone()));
        Self {
            cache: LocalCache::new(store.clone()),
            queue: PendingQueue::new(state.clone()),
            state,
            store,
            remote,
            clock: Arc::new(SystemClock),
            sync_guard: Mutex::new(()),
            config,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// The configured API key, if any.
    pub async fn credential(&self) -> Result<Option<Credential>> {
        let key: Option<String> = self.store.get_typed(keys::API_KEY).await?;
        Ok(key.and_then(|key| Credential::new(key).ok()))
    }

    /// Current local blocked set.
    pub async fn blocked(&self) -> Result<BlockedSet> {
        self.cache.load().await
    }

    pub async fn sync_state(&self) -> Result<SyncState> {
        self.state.load().await
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.queue.list().await
    }

    /// Sync state counts for display.
    pub async fn status(&self) -> Result<StatusSummary> {
        let state = self.state.load().await?;
        Ok(state.status_summary(self.config.backoff.max_attempts()))
    }

    /// Probe the remote with the configured credential.
    ///
    /// # Errors
    /// - `NoCredential` if no API key is configured
    pub async fn check_connection(&self) -> Result<ConnectionCheck> {
        let credential = self.credential().await?.ok_or(Error::NoCredential)?;
        Ok(self.remote.check_connection(&credential).await)
    }

    /// Union-merge the local and remote lists.
    ///
    /// Skipped without any remote call when no API key is configured.
    pub async fn perform_full_sync(&self) -> SyncOutcome {
        let _guard = self.sync_guard.lock().await;
        self.full_sync_locked().await
    }

    /// Same merge as a full sync, run with an explicit credential.
    pub async fn perform_initial_sync(&self, credential: &Credential) -> SyncOutcome {
        let _guard = self.sync_guard.lock().await;
        info!("Starting initial sync");
        let result = self.reconcile(credential).await;
        self.finish_sync(result).await
    }

    /// Store a new API key and run the initial sync with it.
    ///
    /// If the remote rejects the key as unauthorized, the stored key is
    /// removed again so the engine stays offline.
    pub async fn configure_credential(&self, credential: Credential) -> SyncOutcome {
        let _guard = self.sync_guard.lock().await;

        if let Err(e) = self
            .store
            .set(keys::API_KEY, credential.expose().into())
            .await
        {
            error!("Failed to store API key: {}", e);
            return SyncOutcome::Failed {
                error: e.to_string(),
            };
        }

        info!("API key configured, starting initial sync");
        let result = self.reconcile(&credential).await;
        if let Err(e) = &result {
            if e.is_auth() {
                warn!("Remote rejected the new API key, removing it");
                if let Err(e) = self.store.remove(keys::API_KEY).await {
                    error!("Failed to remove rejected API key: {}", e);
                }
            }
        }
        self.finish_sync(result).await
    }

    /// Forget the API key. Later passes are skipped until a new one is set.
    pub async fn clear_credential(&self) -> Result<()> {
        let _guard = self.sync_guard.lock().await;
        info!("Clearing API key");
        self.store.remove(keys::API_KEY).await
    }

    /// Retry pass over the pending queue.
    ///
    /// Operations whose retry time lies in the future, or that exhausted
    /// the backoff schedule, are left untouched.
    pub async fn drain_queue(&self) -> DrainReport {
        let _guard = self.sync_guard.lock().await;
        self.drain_locked(false).await
    }

    /// Full sync followed by an attempt at every queued operation,
    /// regardless of retry time or abandonment.
    pub async fn manual_sync(&self) -> ManualSyncReport {
        let _guard = self.sync_guard.lock().await;
        info!("Starting manual sync");
        let full_sync = self.full_sync_locked().await;
        let drain = self.drain_locked(true).await;
        ManualSyncReport { full_sync, drain }
    }

    /// Block an identity locally and push it to the remote when online.
    pub async fn block(&self, identity: &Identity) -> Result<MutationOutcome> {
        let inserted = self.cache.insert(identity).await?;
        let cancelled = self.queue.remove(identity, OperationType::Unblock).await?;
        if !inserted && !cancelled {
            return Ok(MutationOutcome::Unchanged);
        }

        let Some(credential) = self.credential().await? else {
            debug!("Blocked {} locally (offline)", identity);
            return Ok(MutationOutcome::LocalOnly);
        };

        let result = self.remote.add(&credential, identity).await;
        match classify_attempt(OperationType::Block, result) {
            AttemptOutcome::Confirmed => {
                debug!("Blocked {}", identity);
                Ok(MutationOutcome::Synced)
            }
            AttemptOutcome::Retryable(e) => {
                warn!("Block of {} queued for retry: {}", identity, e);
                self.enqueue(OperationType::Block, identity, &e).await?;
                Ok(MutationOutcome::Queued {
                    error: e.to_string(),
                })
            }
            AttemptOutcome::Permanent(e) => {
                warn!("Remote rejected block of {}: {}", identity, e);
                let message = format!("Failed to block {}: {}", identity, e);
                self.state.update(|s| s.record_failure(message)).await?;
                Ok(MutationOutcome::Rejected {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Unblock an identity locally and remove it from the remote when online.
    ///
    /// A permanent remote failure restores the local entry.
    pub async fn unblock(&self, identity: &Identity) -> Result<MutationOutcome> {
        let removed = self.cache.remove(identity).await?;
        let cancelled = self.queue.remove(identity, OperationType::Block).await?;
        if !removed && !cancelled {
            return Ok(MutationOutcome::Unchanged);
        }

        let Some(credential) = self.credential().await? else {
            debug!("Unblocked {} locally (offline)", identity);
            return Ok(MutationOutcome::LocalOnly);
        };

        let result = self.remote.remove(&credential, identity).await;
        match classify_attempt(OperationType::Unblock, result) {
            AttemptOutcome::Confirmed => {
                debug!("Unblocked {}", identity);
                Ok(MutationOutcome::Synced)
            }
            AttemptOutcome::Retryable(e) => {
                warn!("Unblock of {} queued for retry: {}", identity, e);
                self.enqueue(OperationType::Unblock, identity, &e).await?;
                Ok(MutationOutcome::Queued {
                    error: e.to_string(),
                })
            }
            AttemptOutcome::Permanent(e) => {
                warn!("Remote rejected unblock of {}, restoring: {}", identity, e);
                if removed {
                    self.cache.insert(identity).await?;
                }
                if cancelled {
                    self.enqueue(OperationType::Block, identity, &e).await?;
                }
                let message = format!("Failed to unblock {}: {}", identity, e);
                self.state.update(|s| s.record_failure(message)).await?;
                Ok(MutationOutcome::Rejected {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Empty the local list. When online, queue an unblock for every entry
    /// and push them through with a manual sync.
    pub async fn clear_all(&self) -> Result<ClearOutcome> {
        let previous = self.cache.clear().await?;
        info!("Cleared {} blocked users locally", previous.len());

        if self.credential().await?.is_none() {
            return Ok(ClearOutcome {
                cleared: previous.len(),
                sync: None,
            });
        }

        self.queue
            .retain(|op| !(op.op_type == OperationType::Block && previous.contains(&op.identity)))
            .await?;
        let now = self.clock.now();
        let unblocks = previous
            .iter()
            .map(|identity| PendingOperation::new(OperationType::Unblock, identity.clone(), now))
            .collect();
        self.queue.add_many(unblocks).await?;

        let sync = self.manual_sync().await;
        Ok(ClearOutcome {
            cleared: previous.len(),
            sync: Some(sync),
        })
    }

    /// Process a sync request (for scheduler).
    pub async fn process_request(&self, request: SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::FullSync => SyncResponse::Full(self.perform_full_sync().await),
            SyncRequest::Drain => SyncResponse::Drain(self.drain_queue().await),
            SyncRequest::Manual => SyncResponse::Manual(self.manual_sync().await),
            SyncRequest::Initial(credential) => {
                SyncResponse::Initial(self.configure_credential(credential).await)
            }
            SyncRequest::Shutdown => SyncResponse::ShutDown,
        }
    }

    async fn full_sync_locked(&self) -> SyncOutcome {
        let credential = match self.credential().await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("Skipping full sync: no API key");
                return SyncOutcome::Skipped {
                    reason: SkipReason::NoCredential,
                };
            }
            Err(e) => return self.finish_sync(Err(e)).await,
        };

        info!("Starting full sync");
        let result = self.reconcile(&credential).await;
        self.finish_sync(result).await
    }

    /// The union merge shared by full and initial sync.
    async fn reconcile(&self, credential: &Credential) -> Result<SyncReport> {
        let start = Instant::now();

        let remote: BlockedSet = self
            .remote
            .list(credential)
            .await?
            .into_iter()
            .map(|entry| entry.identity)
            .collect();
        // Runs outside the cache lock: an unblock that lands between the
        // list above and this load is downloaded again, and re-uploaded by
        // the next full sync once its remote removal has gone through.
        let local = self.cache.load().await?;
        let suppressed: BlockedSet = self
            .queue
            .list()
            .await?
            .into_iter()
            .filter(|op| op.op_type == OperationType::Unblock)
            .map(|op| op.identity)
            .collect();

        let plan = MergePlan::compute(&local, &remote, &suppressed);
        debug!(
            "Merge plan: {} to upload, {} to download",
            plan.to_upload.len(),
            plan.to_download.len()
        );

        // Identities the remote is known to hold once uploads finish.
        let mut confirmed = remote;
        let mut failures: Vec<(Identity, String)> = Vec::new();

        if !plan.to_upload.is_empty() {
            match self.remote.bulk_add(credential, &plan.to_upload).await {
                Ok(result) => {
                    let requested: BlockedSet = plan.to_upload.iter().cloned().collect();
                    for item in result.failures() {
                        // Only the first report per requested identity counts.
                        if !requested.contains(&item.identity)
                            || failures.iter().any(|(failed, _)| failed == &item.identity)
                        {
                            debug!("Ignoring bulk result for {}", item.identity);
                            continue;
                        }
                        let message = item
                            .message
                            .clone()
                            .unwrap_or_else(|| "Upload failed".to_string());
                        failures.push((item.identity.clone(), message));
                    }
                    for identity in &plan.to_upload {
                        if !failures.iter().any(|(failed, _)| failed == identity) {
                            confirmed.insert(identity.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!("Bulk upload of {} users failed: {}", plan.to_upload.len(), e);
                    let message = e.to_string();
                    failures = plan
                        .to_upload
                        .iter()
                        .map(|identity| (identity.clone(), message.clone()))
                        .collect();
                }
            }
        }

        let now = self.clock.now();
        let retries = failures
            .iter()
            .map(|(identity, message)| {
                let mut op = PendingOperation::new(OperationType::Block, identity.clone(), now);
                op.last_error = Some(message.clone());
                op
            })
            .collect();
        self.queue.add_many(retries).await?;

        let merged = self.cache.merge(&plan.to_download).await?;

        let upload_failed = failures.len();
        let dropped = self
            .state
            .update(|state| {
                state.record_success(now);
                if upload_failed > 0 {
                    state.record_failure(format!("Failed to upload {} users", upload_failed));
                }
                let before = state.pending_operations.len();
                state.pending_operations.retain(|op| match op.op_type {
                    OperationType::Block => !confirmed.contains(&op.identity),
                    OperationType::Unblock => confirmed.contains(&op.identity),
                });
                before - state.pending_operations.len()
            })
            .await?;
        if dropped > 0 {
            debug!("Dropped {} pending operations already reflected remotely", dropped);
        }

        let report = SyncReport {
            user_count: merged.len(),
            uploaded: plan.to_upload.len().saturating_sub(upload_failed),
            downloaded: plan.to_download.len(),
            upload_failed,
        };
        info!(
            "Full sync completed in {:?}: {} users, {} uploaded, {} downloaded, {} failed",
            start.elapsed(),
            report.user_count,
            report.uploaded,
            report.downloaded,
            report.upload_failed
        );
        Ok(report)
    }

    /// Turn a reconcile result into an outcome, recording failures.
    async fn finish_sync(&self, result: Result<SyncReport>) -> SyncOutcome {
        match result {
            Ok(report) => SyncOutcome::Completed(report),
            Err(e) => {
                error!("Sync failed: {}", e);
                let message = e.to_string();
                let recorded = message.clone();
                if let Err(e) = self.state.update(|s| s.record_failure(recorded)).await {
                    error!("Failed to record sync failure: {}", e);
                }
                SyncOutcome::Failed { error: message }
            }
        }
    }

    async fn drain_locked(&self, force: bool) -> DrainReport {
        let credential = match self.credential().await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("Skipping queue drain: no API key");
                return DrainReport::skipped(SkipReason::NoCredential);
            }
            Err(e) => return DrainReport::failed(e.to_string()),
        };
        let operations = match self.queue.list().await {
            Ok(operations) => operations,
            Err(e) => return DrainReport::failed(e.to_string()),
        };

        let mut report = DrainReport::default();
        if operations.is_empty() {
            return report;
        }

        debug!("Draining {} pending operations (force: {})", operations.len(), force);
        let now = self.clock.now();
        let max_attempts = self.config.backoff.max_attempts();

        for op in operations {
            if !force {
                if op.is_abandoned(max_attempts) {
                    report.abandoned += 1;
                    continue;
                }
                if op.is_deferred(now) {
                    report.deferred += 1;
                    continue;
                }
            }

            report.attempted += 1;
            if let Err(e) = self.attempt(&credential, &op, &mut report).await {
                error!("Stopping queue drain: {}", e);
                report.error = Some(e.to_string());
                break;
            }
        }

        info!("Queue drain finished: {}", report);
        report
    }

    /// Send one queued operation and apply the result to the queue.
    async fn attempt(
        &self,
        credential: &Credential,
        op: &PendingOperation,
        report: &mut DrainReport,
    ) -> Result<()> {
        debug!(
            "Retrying {} of {} (attempt {})",
            op.op_type,
            op.identity,
            op.retry_count + 1
        );
        let result = match op.op_type {
            OperationType::Block => self.remote.add(credential, &op.identity).await,
            OperationType::Unblock => self.remote.remove(credential, &op.identity).await,
        };

        match classify_attempt(op.op_type, result) {
            AttemptOutcome::Confirmed => {
                debug!("{} of {} confirmed", op.op_type, op.identity);
                self.queue.remove(&op.identity, op.op_type).await?;
                let now = self.clock.now();
                self.state.update(|s| s.record_success(now)).await?;
                report.succeeded += 1;
            }
            AttemptOutcome::Retryable(e) => {
                let retry_count = op.retry_count.saturating_add(1);
                let next = self
                    .config
                    .backoff
                    .next_retry_time(self.clock.now(), retry_count);
                warn!(
                    "{} of {} failed (retry {}), next attempt at {}: {}",
                    op.op_type, op.identity, retry_count, next, e
                );
                self.queue
                    .update(
                        &op.identity,
                        op.op_type,
                        OperationPatch::failed_attempt(retry_count, next, e.to_string()),
                    )
                    .await?;
                report.rescheduled += 1;
            }
            AttemptOutcome::Permanent(e) => {
                warn!("{} of {} failed permanently: {}", op.op_type, op.identity, e);
                self.queue.remove(&op.identity, op.op_type).await?;
                let message = format!("Failed to {} {}: {}", op.op_type, op.identity, e);
                self.state.update(|s| s.record_failure(message)).await?;
                report.dropped += 1;
            }
        }
        Ok(())
    }

    async fn enqueue(&self, op_type: OperationType, identity: &Identity, error: &Error) -> Result<()> {
        let mut op = PendingOperation::new(op_type, identity.clone(), self.clock.now());
        op.last_error = Some(error.to_string());
        self.queue.add(op).await?;
        Ok(())
    }
}
