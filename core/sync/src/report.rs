//! Result values returned by sync passes and local mutations.
//!
//! Sync entry points never fail past their boundary; callers inspect these
//! values instead.

use serde::Serialize;
use std::fmt;

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No API key configured. The normal state for offline users.
    #[serde(rename = "no_api_key")]
    NoCredential,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCredential => write!(f, "no_api_key"),
        }
    }
}

/// Counts from a completed full or initial sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Size of the merged local set.
    pub user_count: usize,
    pub uploaded: usize,
    pub downloaded: usize,
    /// Uploads that ended up in the pending queue.
    pub upload_failed: usize,
}

/// Outcome of a full or initial sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped { reason: SkipReason },
    Failed { error: String },
}

impl SyncOutcome {
    /// Whether the pass reached the remote and finished.
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Completed(r) => write!(
                f,
                "{} users, {} uploaded, {} downloaded, {} upload failures",
                r.user_count, r.uploaded, r.downloaded, r.upload_failed
            ),
            SyncOutcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            SyncOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Counts from one pass over the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Operations sent to the remote.
    pub attempted: usize,
    /// Confirmed and removed from the queue.
    pub succeeded: usize,
    /// Failed with a retryable error and backed off.
    pub rescheduled: usize,
    /// Failed permanently and removed from the queue.
    pub dropped: usize,
    /// Left alone because their retry time has not come yet.
    pub deferred: usize,
    /// Left alone because they exhausted their retries.
    pub abandoned: usize,
    pub skipped: Option<SkipReason>,
    /// Local storage failure that stopped the pass early.
    pub error: Option<String>,
}

impl DrainReport {
    pub(crate) fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl fmt::Display for DrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = self.skipped {
            return write!(f, "skipped ({})", reason);
        }
        write!(
            f,
            "{} attempted, {} succeeded, {} rescheduled, {} dropped, {} deferred, {} abandoned",
            self.attempted,
            self.succeeded,
            self.rescheduled,
            self.dropped,
            self.deferred,
            self.abandoned
        )?;
        if let Some(error) = &self.error {
            write!(f, " (stopped: {})", error)?;
        }
        Ok(())
    }
}

/// Full sync followed by a forced drain of the whole queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSyncReport {
    pub full_sync: SyncOutcome,
    pub drain: DrainReport,
}

impl fmt::Display for ManualSyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync {}; queue {}", self.full_sync, self.drain)
    }
}

/// What happened to an optimistic block or unblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Local state already matched; nothing was sent.
    Unchanged,
    /// Applied locally and confirmed by the remote.
    Synced,
    /// Applied locally; the remote call failed and was queued for retry.
    Queued { error: String },
    /// Applied locally; no API key, so the remote was not contacted.
    LocalOnly,
    /// The remote refused the change permanently.
    Rejected { error: String },
}

impl fmt::Display for MutationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOutcome::Unchanged => write!(f, "unchanged"),
            MutationOutcome::Synced => write!(f, "synced"),
            MutationOutcome::Queued { error } => write!(f, "queued for retry ({})", error),
            MutationOutcome::LocalOnly => write!(f, "saved locally"),
            MutationOutcome::Rejected { error } => write!(f, "rejected: {}", error),
        }
    }
}

/// Result of emptying the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearOutcome {
    /// Identities removed locally.
    pub cleared: usize,
    /// The manual sync run afterwards, when online.
    pub sync: Option<ManualSyncReport>,
}
