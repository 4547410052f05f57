//! Integration tests for reconciliation passes.
//!
//! Uses MockInventory and MemoryStore to exercise the full pass:
//! 1. Inventory fetch
//! 2. Desired entries and namespace snapshot
//! 3. Writes
//! 4. Cleanup of stale entries

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::rstest;
use subproxy_reconcile::{EntryLayout, Namespace, WorkloadUnit, ROUTING_LABEL};
use subproxy_registrar::mock::{MemoryStore, MockInventory, StoreOp};
use subproxy_registrar::{ReconcileError, Reconciler, ReconcilerConfig};

fn routed(name: &str, domains: &str) -> WorkloadUnit {
    WorkloadUnit::new(format!("id_{name}"), format!("/{name}")).with_label(ROUTING_LABEL, domains)
}

fn harness(
    units: Vec<WorkloadUnit>,
    layout: EntryLayout,
) -> (Arc<MockInventory>, Arc<MemoryStore>, Reconciler) {
    let inventory = Arc::new(MockInventory::new(units));
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(
        inventory.clone(),
        store.clone(),
        ReconcilerConfig {
            namespace: Namespace::default(),
            layout,
        },
    );
    (inventory, store, reconciler)
}

fn json_value(name: &str, domains: &str) -> String {
    EntryLayout::Json.value_for(name, domains)
}

#[tokio::test]
async fn test_routed_unit_replaces_stale_entry() {
    let (_inventory, store, reconciler) = harness(
        vec![
            routed("a", "a.example.com"),
            WorkloadUnit::new("id_b", "/b"),
        ],
        EntryLayout::Json,
    );
    store.insert("/subproxies/c", &json_value("c", "c.example.com"));

    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.deleted, 1);

    let entries = store.entries();
    assert_eq!(entries.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&entries["/subproxies/a"]).unwrap();
    assert_eq!(value["container"], "a");
    assert_eq!(value["domain_names"], "a.example.com");
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let (_inventory, store, reconciler) = harness(
        vec![routed("a", "a.example.com"), routed("b", "b.example.com")],
        EntryLayout::Hosts,
    );

    reconciler.reconcile().await.unwrap();
    let after_first = store.entries();
    store.clear_ops();

    let report = reconciler.reconcile().await.unwrap();

    assert!(!report.changed());
    assert_eq!(report.unchanged, 2);
    assert_eq!(store.entries(), after_first);
    assert!(store.ops().is_empty());
}

#[rstest]
#[case(EntryLayout::Json)]
#[case(EntryLayout::Hosts)]
#[tokio::test]
async fn test_pass_converges_to_desired_entries(#[case] layout: EntryLayout) {
    let (_inventory, store, reconciler) = harness(
        vec![
            routed("api", "api.example.com"),
            routed("web", "www.example.com,example.com"),
            WorkloadUnit::new("id_db", "/db"),
        ],
        layout,
    );
    let ns = Namespace::default();
    store.insert(&layout.key_for(&ns, "web"), &layout.value_for("web", "old.example.com"));
    store.insert(&layout.key_for(&ns, "gone"), &layout.value_for("gone", "gone.example.com"));

    reconciler.reconcile().await.unwrap();

    let expected: BTreeMap<String, String> = [
        ("api", "api.example.com"),
        ("web", "www.example.com,example.com"),
    ]
    .into_iter()
    .map(|(name, domains)| (layout.key_for(&ns, name), layout.value_for(name, domains)))
    .collect();
    assert_eq!(store.entries(), expected);
}

#[tokio::test]
async fn test_cleanup_removes_only_unconfigured_entries() {
    let (_inventory, store, reconciler) =
        harness(vec![routed("keep", "keep.example.com")], EntryLayout::Hosts);
    store.insert("/subproxies/keep/hosts", "keep.example.com");
    store.insert("/subproxies/stale/hosts", "stale.example.com");
    store.insert("/subproxies/stale/extra", "left by an older writer");
    store.insert("/elsewhere/stale/hosts", "not ours");

    reconciler.reconcile().await.unwrap();

    assert_eq!(
        store.ops(),
        vec![StoreOp::Delete("/subproxies/stale".to_string())]
    );
    let entries = store.entries();
    assert!(entries.contains_key("/subproxies/keep/hosts"));
    assert!(entries.contains_key("/elsewhere/stale/hosts"));
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_dropping_routing_label_removes_entry() {
    let (inventory, store, reconciler) = harness(
        vec![routed("a", "a.example.com"), routed("b", "b.example.com")],
        EntryLayout::Json,
    );
    reconciler.reconcile().await.unwrap();
    assert_eq!(store.entries().len(), 2);

    inventory.set_units(vec![
        routed("a", "a.example.com"),
        WorkloadUnit::new("id_b", "/b").with_label(ROUTING_LABEL, ""),
    ]);
    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(
        store.entries().keys().collect::<Vec<_>>(),
        vec!["/subproxies/a"]
    );
}

#[tokio::test]
async fn test_inventory_failure_leaves_store_untouched() {
    let (inventory, store, reconciler) = harness(vec![], EntryLayout::Json);
    store.insert("/subproxies/a", &json_value("a", "a.example.com"));
    inventory.set_failing(true);

    let err = reconciler.reconcile().await.unwrap_err();

    assert!(matches!(err, ReconcileError::Inventory(_)));
    assert!(store.ops().is_empty());
    assert_eq!(store.entries().len(), 1);
}

#[tokio::test]
async fn test_write_failure_aborts_pass() {
    let (_inventory, store, reconciler) = harness(
        vec![
            routed("a", "a.example.com"),
            routed("b", "b.example.com"),
            routed("c", "c.example.com"),
        ],
        EntryLayout::Json,
    );
    store.insert("/subproxies/stale", &json_value("stale", "stale.example.com"));
    store.fail_set("/subproxies/b");

    let err = reconciler.reconcile().await.unwrap_err();

    match err {
        ReconcileError::Write { name, key, .. } => {
            assert_eq!(name, "b");
            assert_eq!(key, "/subproxies/b");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Writes stop at the failure; no cleanup ran.
    assert_eq!(store.ops(), vec![StoreOp::Set("/subproxies/a".to_string())]);
    assert!(store.entries().contains_key("/subproxies/stale"));
}

#[tokio::test]
async fn test_next_pass_recovers_after_write_failure() {
    let (_inventory, store, reconciler) = harness(
        vec![routed("a", "a.example.com"), routed("b", "b.example.com")],
        EntryLayout::Json,
    );
    store.set_unavailable(true);
    assert!(reconciler.reconcile().await.is_err());

    store.set_unavailable(false);
    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(store.entries().len(), 2);
}

#[tokio::test]
async fn test_unreadable_namespace_still_writes_but_skips_cleanup() {
    let (_inventory, store, reconciler) =
        harness(vec![routed("a", "a.example.com")], EntryLayout::Json);
    store.insert("/subproxies/stale", &json_value("stale", "stale.example.com"));
    store.fail_lists(true);

    let err = reconciler.reconcile().await.unwrap_err();

    assert!(matches!(err, ReconcileError::CleanupRead { .. }));
    let entries = store.entries();
    assert!(entries.contains_key("/subproxies/a"));
    assert!(entries.contains_key("/subproxies/stale"));

    store.fail_lists(false);
    reconciler.reconcile().await.unwrap();
    assert!(!store.entries().contains_key("/subproxies/stale"));
}

#[tokio::test]
async fn test_delete_failure_continues_cleanup() {
    let (_inventory, store, reconciler) = harness(vec![], EntryLayout::Json);
    store.insert("/subproxies/x", &json_value("x", "x.example.com"));
    store.insert("/subproxies/y", &json_value("y", "y.example.com"));
    store.fail_delete("/subproxies/x");

    let err = reconciler.reconcile().await.unwrap_err();

    match err {
        ReconcileError::Cleanup { keys } => assert_eq!(keys, vec!["/subproxies/x".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        store.entries().keys().collect::<Vec<_>>(),
        vec!["/subproxies/x"]
    );
}

#[tokio::test]
async fn test_changed_declaration_updates_entry() {
    let (inventory, store, reconciler) =
        harness(vec![routed("a", "a.example.com")], EntryLayout::Hosts);
    reconciler.reconcile().await.unwrap();

    inventory.set_units(vec![routed("a", "a.example.com,a.example.org")]);
    store.clear_ops();
    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(
        store.ops(),
        vec![StoreOp::Set("/subproxies/a/hosts".to_string())]
    );
    assert_eq!(
        store.entries()["/subproxies/a/hosts"],
        "a.example.com,a.example.org"
    );
}
