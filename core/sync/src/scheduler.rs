//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use blocksync_common::{Credential, Error, Result};

use crate::report::{DrainReport, ManualSyncReport, SyncOutcome};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests trigger passes.
    Manual,
    /// Full syncs and queue drains on their own timers, plus requests.
    Periodic {
        full_sync_interval: Duration,
        drain_interval: Duration,
        /// Wait before the first timed pass of either kind.
        initial_delay: Duration,
    },
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Full reconciliation, skipped when offline.
    FullSync,
    /// Retry pass over the pending queue.
    Drain,
    /// Full sync followed by a forced drain.
    Manual,
    /// Store a new credential and reconcile with it.
    Initial(Credential),
    /// Stop the scheduler.
    Shutdown,
}

/// Response to a `SyncRequest`, one variant per request kind.
#[derive(Debug, Clone)]
pub enum SyncResponse {
    Full(SyncOutcome),
    Drain(DrainReport),
    Manual(ManualSyncReport),
    Initial(SyncOutcome),
    ShutDown,
}

type Envelope = (SyncRequest, oneshot::Sender<SyncResponse>);

/// Front end for submitting requests to a running scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }

    /// Request a full sync.
    pub async fn request_full_sync(&self) -> Result<SyncOutcome> {
        match self.request(SyncRequest::FullSync).await? {
            SyncResponse::Full(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Request a queue drain.
    pub async fn request_drain(&self) -> Result<DrainReport> {
        match self.request(SyncRequest::Drain).await? {
            SyncResponse::Drain(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Request a manual sync.
    pub async fn request_manual_sync(&self) -> Result<ManualSyncReport> {
        match self.request(SyncRequest::Manual).await? {
            SyncResponse::Manual(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Request the initial sync for a newly configured credential.
    pub async fn request_initial_sync(&self, credential: Credential) -> Result<SyncOutcome> {
        match self.request(SyncRequest::Initial(credential)).await? {
            SyncResponse::Initial(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Shutdown the scheduler and wait for it to acknowledge.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(SyncRequest::Shutdown).await.map(|_| ())
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))
    }
}

fn unexpected(response: SyncResponse) -> Error {
    Error::Scheduler(format!("Unexpected response: {:?}", response))
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` runs every request
    /// and every timed pass, one at a time. The loop ends on `Shutdown` or
    /// when every `SyncScheduler` has been dropped.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SyncResponse> + Send,
    {
        let (mut full_timer, mut drain_timer) = match &self.mode {
            SyncMode::Manual => (None, None),
            SyncMode::Periodic {
                full_sync_interval,
                drain_interval,
                initial_delay,
            } => (
                periodic_timer(*initial_delay, *full_sync_interval),
                periodic_timer(*initial_delay, *drain_interval),
            ),
        };

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                envelope = self.request_rx.recv() => {
                    let Some((request, response_tx)) = envelope else {
                        info!("Sync scheduler has no more requesters");
                        break;
                    };
                    if matches!(request, SyncRequest::Shutdown) {
                        info!("Received shutdown request");
                        let _ = response_tx.send(SyncResponse::ShutDown);
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let response = sync_fn(request).await;
                    let _ = response_tx.send(response);
                }

                _ = tick(&mut full_timer) => {
                    debug!("Triggering periodic full sync");
                    log_periodic(sync_fn(SyncRequest::FullSync).await);
                }

                _ = tick(&mut drain_timer) => {
                    debug!("Triggering periodic queue drain");
                    log_periodic(sync_fn(SyncRequest::Drain).await);
                }
            }
        }
    }
}

fn periodic_timer(initial_delay: Duration, period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut timer = interval_at(Instant::now() + initial_delay, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_periodic(response: SyncResponse) {
    match response {
        SyncResponse::Full(outcome @ SyncOutcome::Failed { .. }) => {
            warn!("Periodic sync {}", outcome)
        }
        SyncResponse::Full(outcome) => info!("Periodic sync: {}", outcome),
        SyncResponse::Drain(report) if report.error.is_some() => {
            warn!("Periodic drain: {}", report)
        }
        SyncResponse::Drain(report) => info!("Periodic drain: {}", report),
        other => debug!("Periodic pass returned {:?}", other),
    }
}
