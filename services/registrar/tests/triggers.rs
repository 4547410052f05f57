//! Integration tests for trigger sources, pass scheduling and shutdown.

use std::sync::Arc;
use std::time::Duration;

use subproxy_reconcile::{EntryLayout, Namespace, WorkloadUnit, ROUTING_LABEL};
use subproxy_registrar::inventory::{EventFilter, InventoryError};
use subproxy_registrar::mock::{MemoryStore, MockEvents, MockInventory};
use subproxy_registrar::trigger::{run_once, run_polling, PassScheduler};
use subproxy_registrar::{run_daemon, Reconciler, ReconcilerConfig, TriggerError, TriggerMode};
use tokio::sync::{oneshot, watch};

fn routed(name: &str) -> WorkloadUnit {
    WorkloadUnit::new(format!("id_{name}"), format!("/{name}"))
        .with_label(ROUTING_LABEL, format!("{name}.example.com"))
}

fn harness(units: Vec<WorkloadUnit>) -> (Arc<MockInventory>, Arc<MemoryStore>, Arc<Reconciler>) {
    let inventory = Arc::new(MockInventory::new(units));
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(Reconciler::new(
        inventory.clone(),
        store.clone(),
        ReconcilerConfig {
            namespace: Namespace::default(),
            layout: EntryLayout::Hosts,
        },
    ));
    (inventory, store, reconciler)
}

#[tokio::test]
async fn test_run_once_runs_a_single_pass() {
    let (inventory, store, reconciler) = harness(vec![routed("a")]);

    let report = run_once(&reconciler).await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(inventory.calls(), 1);
    assert_eq!(store.entries().len(), 1);
}

#[tokio::test]
async fn test_triggers_during_a_pass_coalesce_into_one() {
    let (inventory, _store, reconciler) = harness(vec![routed("a")]);
    let gate = inventory.gate();
    let scheduler = PassScheduler::spawn(reconciler);

    assert!(scheduler.trigger());
    inventory.wait_for_calls(1).await;

    // First pass is blocked in the inventory fetch. One follow-up is queued,
    // the rest fold into it.
    let accepted = (0..10).filter(|_| scheduler.trigger()).count();
    assert_eq!(accepted, 1);

    gate.add_permits(1);
    inventory.wait_for_calls(2).await;

    // The follow-up pass is running; shutdown waits for it.
    gate.add_permits(1);
    let stats = scheduler.shutdown().await;

    assert_eq!(stats.passes, 2);
    assert_eq!(stats.coalesced, 9);
    assert_eq!(stats.failed, 0);
    assert_eq!(inventory.calls(), 2);
}

#[tokio::test]
async fn test_failed_passes_are_counted_not_fatal() {
    let (inventory, store, reconciler) = harness(vec![routed("a")]);
    inventory.set_failing(true);
    let scheduler = PassScheduler::spawn(reconciler);

    scheduler.trigger();
    inventory.wait_for_calls(1).await;

    // The worker keeps serving triggers after a failed pass.
    scheduler.trigger();
    inventory.wait_for_calls(2).await;

    let stats = scheduler.shutdown().await;
    assert_eq!(stats.passes, 2);
    assert_eq!(stats.failed, 2);
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn test_shutdown_drops_queued_pass() {
    let (inventory, store, reconciler) = harness(vec![routed("a")]);
    let gate = inventory.gate();
    let scheduler = PassScheduler::spawn(reconciler);

    assert!(scheduler.trigger());
    inventory.wait_for_calls(1).await;
    assert!(scheduler.trigger());

    // Release the running pass only after the stop request is in.
    let release = async {
        tokio::task::yield_now().await;
        gate.add_permits(2);
    };
    let (stats, ()) = tokio::join!(scheduler.shutdown(), release);

    assert_eq!(stats.passes, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(inventory.calls(), 1);
    assert_eq!(store.entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_polling_runs_immediately_then_on_interval() {
    let (inventory, _store, reconciler) = harness(vec![routed("a")]);
    let scheduler = PassScheduler::spawn(reconciler);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = tokio::spawn(run_polling(
        scheduler.handle(),
        Duration::from_secs(10),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(inventory.calls(), 3);

    shutdown_tx.send(true).unwrap();
    poller.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(inventory.calls(), 3);

    let stats = scheduler.shutdown().await;
    assert_eq!(stats.passes, 3);
}

#[tokio::test]
async fn test_polling_rejects_zero_interval() {
    let (_inventory, _store, reconciler) = harness(vec![]);
    let scheduler = PassScheduler::spawn(reconciler);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = run_polling(scheduler.handle(), Duration::ZERO, shutdown_rx).await;

    assert!(matches!(result, Err(TriggerError::ZeroInterval)));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_events_trigger_passes_until_stream_closes() {
    let (inventory, store, reconciler) = harness(vec![routed("a")]);
    let (events, tx) = MockEvents::new();
    let events = Arc::new(events);

    let daemon = tokio::spawn(run_daemon(
        reconciler,
        TriggerMode::Events {
            events: events.clone(),
            filter: EventFilter::network(),
        },
        std::future::pending::<()>(),
    ));

    // Initial pass on subscribe.
    inventory.wait_for_calls(1).await;

    // Units change before the notification, so the pass it triggers sees them
    // even if it has to queue behind the initial one.
    inventory.set_units(vec![routed("a"), routed("b")]);
    tx.send(Ok(MockEvents::connect("b"))).unwrap();
    inventory.wait_for_calls(2).await;

    // A dead stream stops the daemon instead of leaving it idle forever. The
    // daemon still lets the running pass finish.
    drop(tx);
    let result = daemon.await.unwrap();

    assert!(matches!(result, Err(TriggerError::StreamClosed)));
    assert_eq!(events.filters(), vec![EventFilter::network()]);
    assert_eq!(store.entries().len(), 2);
}

#[tokio::test]
async fn test_event_stream_error_is_fatal() {
    let (_inventory, _store, reconciler) = harness(vec![]);
    let (events, tx) = MockEvents::new();

    tx.send(Err(InventoryError::Stream("connection reset".to_string())))
        .unwrap();

    let result = run_daemon(
        reconciler,
        TriggerMode::Events {
            events: Arc::new(events),
            filter: EventFilter::network(),
        },
        std::future::pending::<()>(),
    )
    .await;

    assert!(matches!(result, Err(TriggerError::StreamFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_pass() {
    let (inventory, store, reconciler) = harness(vec![routed("a")]);
    let gate = inventory.gate();
    let (signal_tx, signal_rx) = oneshot::channel::<()>();

    let daemon = tokio::spawn(run_daemon(
        reconciler,
        TriggerMode::Polling(Duration::from_secs(3600)),
        async move {
            let _ = signal_rx.await;
        },
    ));

    inventory.wait_for_calls(1).await;
    signal_tx.send(()).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!daemon.is_finished());
    assert!(store.entries().is_empty());

    gate.add_permits(1);
    let stats = daemon.await.unwrap().unwrap();

    assert_eq!(stats.passes, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(store.entries().len(), 1);
}
