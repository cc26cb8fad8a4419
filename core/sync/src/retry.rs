//! Fixed backoff schedule and retry classification for queued operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use blocksync_common::{Error, Result};

use crate::state::OperationType;

/// Fixed, escalating sequence of waits between retries.
///
/// Retry `n` (1-based) waits `delays[n - 1]`. Once an operation has been
/// retried `delays.len()` times it is abandoned by scheduled drains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u64>", into = "Vec<u64>")]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Create a schedule from explicit delays.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Number of automatic retries before an operation is abandoned.
    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32
    }

    /// The configured delays, in order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay applied after the `retry_count`-th failure.
    ///
    /// Counts past the end of the schedule reuse the last delay; a count of
    /// zero uses the first.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (retry_count.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// When an operation that has now failed `retry_count` times may run again.
    pub fn next_retry_time(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(retry_count);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffSchedule {
    /// 1 hour, 4 hours, 12 hours.
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(60 * 60),
            Duration::from_secs(4 * 60 * 60),
            Duration::from_secs(12 * 60 * 60),
        ])
    }
}

impl From<Vec<u64>> for BackoffSchedule {
    fn from(secs: Vec<u64>) -> Self {
        Self::new(secs.into_iter().map(Duration::from_secs).collect())
    }
}

impl From<BackoffSchedule> for Vec<u64> {
    fn from(schedule: BackoffSchedule) -> Self {
        schedule.delays.iter().map(Duration::as_secs).collect()
    }
}

/// What a single remote attempt means for its queued operation.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Remote state now reflects the operation.
    Confirmed,
    /// Transient failure; keep the operation and back off.
    Retryable(Error),
    /// Permanent failure; retrying is pointless.
    Permanent(Error),
}

/// Classify the result of a remote add/remove.
///
/// A block answered with a conflict and an unblock answered with not-found
/// both mean the remote already holds the desired state.
pub fn classify_attempt(op_type: OperationType, result: Result<()>) -> AttemptOutcome {
    match result {
        Ok(()) => AttemptOutcome::Confirmed,
        Err(Error::Conflict(_)) if op_type == OperationType::Block => AttemptOutcome::Confirmed,
        Err(Error::NotFound(_)) if op_type == OperationType::Unblock => AttemptOutcome::Confirmed,
        Err(err) if err.is_retryable() => AttemptOutcome::Retryable(err),
        Err(err) => AttemptOutcome::Permanent(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.max_attempts(), 3);
        assert_eq!(schedule.delay_for_attempt(1), Duration::from_secs(3600));
        assert_eq!(schedule.delay_for_attempt(2), Duration::from_secs(4 * 3600));
        assert_eq!(schedule.delay_for_attempt(3), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_delay_clamps_past_end() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.delay_for_attempt(7), Duration::from_secs(12 * 3600));
        assert_eq!(schedule.delay_for_attempt(0), Duration::from_secs(3600));
        assert_eq!(BackoffSchedule::new(vec![]).delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_next_retry_time() {
        let schedule = BackoffSchedule::default();
        let now = Utc::now();
        assert_eq!(
            schedule.next_retry_time(now, 2),
            now + chrono::Duration::hours(4)
        );
    }

    #[test]
    fn test_schedule_serializes_as_seconds() {
        let json = serde_json::to_string(&BackoffSchedule::default()).unwrap();
        assert_eq!(json, "[3600,14400,43200]");

        let parsed: BackoffSchedule = serde_json::from_str("[60,120]").unwrap();
        assert_eq!(parsed.max_attempts(), 2);
        assert_eq!(parsed.delay_for_attempt(2), Duration::from_secs(120));
    }

    #[test]
    fn test_idempotent_errors_confirm() {
        assert!(matches!(
            classify_attempt(OperationType::Block, Err(Error::from_status(409, "dup"))),
            AttemptOutcome::Confirmed
        ));
        assert!(matches!(
            classify_attempt(OperationType::Unblock, Err(Error::from_status(404, "gone"))),
            AttemptOutcome::Confirmed
        ));
    }

    #[test]
    fn test_idempotence_is_per_operation() {
        assert!(matches!(
            classify_attempt(OperationType::Block, Err(Error::from_status(404, "gone"))),
            AttemptOutcome::Permanent(_)
        ));
        assert!(matches!(
            classify_attempt(OperationType::Unblock, Err(Error::from_status(409, "dup"))),
            AttemptOutcome::Permanent(_)
        ));
    }

    #[test]
    fn test_transient_and_permanent() {
        assert!(matches!(
            classify_attempt(OperationType::Block, Err(Error::Network("down".to_string()))),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_attempt(OperationType::Unblock, Err(Error::from_status(500, "boom"))),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_attempt(OperationType::Block, Err(Error::from_status(401, "key"))),
            AttemptOutcome::Permanent(_)
        ));
    }
}
