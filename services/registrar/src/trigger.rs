//! Trigger sources and the pass scheduler.
//!
//! ```text
//! run_polling ──┐
//!               ├─ TriggerHandle ─▶ [1-slot queue] ─▶ worker ─▶ Reconciler::reconcile
//! run_on_events ┘
//! ```
//!
//! The worker runs one pass at a time. A trigger that arrives while a pass is
//! running queues exactly one follow-up pass; further triggers are coalesced
//! into it. On shutdown the running pass completes and a queued one is
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::inventory::{EventFilter, InventoryError, WorkloadEvents};
use crate::reconciler::{PassReport, ReconcileError, Reconciler};

/// Errors that end a trigger loop. All of them are fatal for the daemon.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("polling interval must be greater than zero")]
    ZeroInterval,

    #[error("failed to subscribe to workload events: {0}")]
    Subscribe(#[source] InventoryError),

    #[error("workload event stream failed: {0}")]
    StreamFailed(#[source] InventoryError),

    #[error("workload event stream closed")]
    StreamClosed,

    #[error("trigger task failed: {0}")]
    Task(String),
}

/// Counters reported when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Passes started.
    pub passes: u64,

    /// Passes that ended with an error.
    pub failed: u64,

    /// Triggers folded into an already queued pass.
    pub coalesced: u64,
}

/// Cheap handle for requesting passes.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
    coalesced: Arc<AtomicU64>,
}

impl TriggerHandle {
    /// Request a pass. Never blocks.
    ///
    /// Returns false if the request was folded into an already queued pass or
    /// the scheduler has stopped.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Pass already queued, trigger coalesced");
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Runs reconciliation passes one at a time on a dedicated task.
pub struct PassScheduler {
    handle: TriggerHandle,
    stop: oneshot::Sender<()>,
    worker: JoinHandle<SchedulerStats>,
}

impl PassScheduler {
    /// Spawn the worker task.
    pub fn spawn(reconciler: Arc<Reconciler>) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let worker = tokio::spawn(async move {
            let mut stats = SchedulerStats::default();

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    request = rx.recv() => {
                        if request.is_none() {
                            break;
                        }
                    }
                }

                stats.passes += 1;
                if let Err(e) = reconciler.reconcile().await {
                    stats.failed += 1;
                    error!(pass = stats.passes, error = %e, "Reconciliation pass failed");
                }
            }

            stats
        });

        Self {
            handle: TriggerHandle {
                tx,
                coalesced: Arc::new(AtomicU64::new(0)),
            },
            stop,
            worker,
        }
    }

    /// A handle trigger sources use to request passes.
    pub fn handle(&self) -> TriggerHandle {
        self.handle.clone()
    }

    /// Request a pass.
    pub fn trigger(&self) -> bool {
        self.handle.trigger()
    }

    /// Stop the worker, waiting for a running pass to finish.
    pub async fn shutdown(self) -> SchedulerStats {
        let coalesced = self.handle.coalesced.load(Ordering::Relaxed);
        let _ = self.stop.send(());

        let mut stats = match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Scheduler worker panicked");
                SchedulerStats::default()
            }
        };
        stats.coalesced = coalesced;
        stats
    }
}

/// Whether the shutdown channel has fired (or its sender is gone).
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run exactly one pass in the caller's task.
pub async fn run_once(reconciler: &Reconciler) -> Result<PassReport, ReconcileError> {
    info!("Running single reconciliation pass");
    reconciler.reconcile().await
}

/// Request a pass immediately and then once per `interval` until shutdown.
pub async fn run_polling(
    trigger: TriggerHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TriggerError> {
    if interval.is_zero() {
        return Err(TriggerError::ZeroInterval);
    }

    info!(interval_secs = interval.as_secs_f64(), "Starting polling trigger");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                trigger.trigger();
            }
            _ = shutdown_requested(&mut shutdown) => {
                info!("Polling trigger shutting down");
                return Ok(());
            }
        }
    }
}

/// Request a pass on subscribe and after every lifecycle notification.
///
/// The stream ending or failing is fatal: workload changes would no longer be
/// observed.
pub async fn run_on_events(
    trigger: TriggerHandle,
    events: Arc<dyn WorkloadEvents>,
    filter: EventFilter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TriggerError> {
    let mut stream = events
        .subscribe(&filter)
        .await
        .map_err(TriggerError::Subscribe)?;

    info!(types = ?filter.types, events = ?filter.events, "Subscribed to workload events");

    // Changes made before the subscription are only seen by a full pass.
    trigger.trigger();

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    debug!(
                        kind = %event.kind,
                        action = %event.action,
                        container = event.container().unwrap_or_default(),
                        "Workload event"
                    );
                    trigger.trigger();
                }
                Some(Err(e)) => {
                    error!(error = %e, "Workload event stream failed");
                    return Err(TriggerError::StreamFailed(e));
                }
                None => {
                    error!("Workload event stream closed");
                    return Err(TriggerError::StreamClosed);
                }
            },
            _ = shutdown_requested(&mut shutdown) => {
                info!("Event trigger shutting down");
                return Ok(());
            }
        }
    }
}
