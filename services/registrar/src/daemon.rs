//! Daemon supervision: trigger loop, pass scheduler and shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::inventory::{EventFilter, WorkloadEvents};
use crate::reconciler::Reconciler;
use crate::trigger::{self, PassScheduler, SchedulerStats, TriggerError};

/// What drives passes in daemon mode.
pub enum TriggerMode {
    /// A pass on start and once per interval.
    Polling(Duration),

    /// A pass on subscribe and after every matching lifecycle notification.
    Events {
        events: Arc<dyn WorkloadEvents>,
        filter: EventFilter,
    },
}

/// Run the trigger loop until `signal` resolves or the loop fails.
///
/// On either outcome the trigger loop is stopped first, then the running pass
/// is allowed to finish before this returns.
pub async fn run_daemon<S>(
    reconciler: Arc<Reconciler>,
    mode: TriggerMode,
    signal: S,
) -> Result<SchedulerStats, TriggerError>
where
    S: Future<Output = ()> + Send,
{
    let scheduler = PassScheduler::spawn(reconciler);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = scheduler.handle();
    let mut trigger_task = tokio::spawn(async move {
        match mode {
            TriggerMode::Polling(interval) => {
                trigger::run_polling(handle, interval, shutdown_rx).await
            }
            TriggerMode::Events { events, filter } => {
                trigger::run_on_events(handle, events, filter, shutdown_rx).await
            }
        }
    });

    let joined = tokio::select! {
        _ = signal => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            (&mut trigger_task).await
        }
        joined = &mut trigger_task => joined,
    };

    let outcome = joined.unwrap_or_else(|e| Err(TriggerError::Task(e.to_string())));
    if let Err(e) = &outcome {
        error!(error = %e, "Trigger loop stopped");
    }

    info!("Waiting for in-flight reconciliation to finish...");
    let stats = scheduler.shutdown().await;
    info!(
        passes = stats.passes,
        failed = stats.failed,
        coalesced = stats.coalesced,
        "Scheduler stopped"
    );

    outcome.map(|()| stats)
}
