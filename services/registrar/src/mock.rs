//! In-memory collaborators for testing and development.
//!
//! - `MockInventory`: a settable unit list with failure injection and an
//!   optional gate that holds listing calls until released
//! - `MemoryStore`: an etcd-like hierarchical store with implicit directories
//! - `MockEvents`: an event source fed through a channel

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream;
use subproxy_reconcile::{StoreNode, WorkloadUnit};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::debug;

use crate::inventory::{
    EventFilter, EventStream, InventoryError, WorkloadEvent, WorkloadEvents, WorkloadInventory,
};
use crate::store::{KeyValueStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock workload inventory.
#[derive(Default)]
pub struct MockInventory {
    units: Mutex<Vec<WorkloadUnit>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    calls_changed: Notify,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockInventory {
    pub fn new(units: Vec<WorkloadUnit>) -> Self {
        Self {
            units: Mutex::new(units),
            ..Self::default()
        }
    }

    /// Replace the running units.
    pub fn set_units(&self, units: Vec<WorkloadUnit>) {
        *lock(&self.units) = units;
    }

    /// Make every listing fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every listing call until a permit is added to the returned gate.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Number of listing calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` listing calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.calls_changed.notified();
            if self.calls() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl WorkloadInventory for MockInventory {
    async fn list_units(&self, label: &str) -> Result<Vec<WorkloadUnit>, InventoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.calls_changed.notify_waiters();

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(InventoryError::Unreachable("[MOCK] runtime down".to_string()));
        }

        Ok(lock(&self.units)
            .iter()
            .filter(|unit| unit.labels.contains_key(label))
            .cloned()
            .collect())
    }
}

/// A mutating operation recorded by `MemoryStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set(String),
    Delete(String),
}

/// In-memory hierarchical store. Only leaves are stored; directories exist
/// while they have descendants.
#[derive(Default)]
pub struct MemoryStore {
    leaves: Mutex<BTreeMap<String, String>>,
    ops: Mutex<Vec<StoreOp>>,
    unavailable: AtomicBool,
    failing_lists: AtomicBool,
    failing_sets: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without recording an operation.
    pub fn insert(&self, key: &str, value: &str) {
        lock(&self.leaves).insert(key.to_string(), value.to_string());
    }

    /// All leaves currently stored.
    pub fn entries(&self) -> BTreeMap<String, String> {
        lock(&self.leaves).clone()
    }

    /// Mutating operations performed through the store interface.
    pub fn ops(&self) -> Vec<StoreOp> {
        lock(&self.ops).clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.ops).clear();
    }

    /// Fail every operation with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail child listings only.
    pub fn fail_lists(&self, failing: bool) {
        self.failing_lists.store(failing, Ordering::SeqCst);
    }

    /// Fail writes to `key`.
    pub fn fail_set(&self, key: &str) {
        lock(&self.failing_sets).insert(key.to_string());
    }

    /// Fail deletes of `key`.
    pub fn fail_delete(&self, key: &str) {
        lock(&self.failing_deletes).insert(key.to_string());
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport {
                endpoint: "memory".to_string(),
                message: "[MOCK] store unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn injected(key: &str) -> StoreError {
        StoreError::Timeout {
            endpoint: format!("memory{key}"),
            timeout: std::time::Duration::from_secs(0),
        }
    }

    fn is_dir(leaves: &BTreeMap<String, String>, key: &str) -> bool {
        let prefix = format!("{key}/");
        leaves.keys().any(|k| k.starts_with(&prefix))
    }

    /// Build the node for `key` from the leaves beneath it.
    fn node(leaves: &BTreeMap<String, String>, key: &str) -> Option<StoreNode> {
        if let Some(value) = leaves.get(key) {
            return Some(StoreNode::leaf(key, value.clone()));
        }
        if !Self::is_dir(leaves, key) {
            return None;
        }

        let prefix = format!("{key}/");
        let children: BTreeSet<String> = leaves
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest))
            .map(|segment| format!("{prefix}{segment}"))
            .collect();

        let nodes = children
            .iter()
            .filter_map(|child| Self::node(leaves, child))
            .collect();
        Some(StoreNode::directory(key, nodes))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<StoreNode, StoreError> {
        self.check_available()?;
        let leaves = lock(&self.leaves);
        Self::node(&leaves, key).ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        if lock(&self.failing_sets).contains(key) {
            return Err(Self::injected(key));
        }

        let mut leaves = lock(&self.leaves);
        if Self::is_dir(&leaves, key) {
            return Err(StoreError::Api {
                status: 403,
                code: 102,
                message: "Not a file".to_string(),
            });
        }
        let mut ancestor = key;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if leaves.contains_key(parent) {
                return Err(StoreError::Api {
                    status: 400,
                    code: 104,
                    message: "Not a directory".to_string(),
                });
            }
            ancestor = parent;
        }

        debug!(key, "[MOCK] set");
        leaves.insert(key.to_string(), value.to_string());
        lock(&self.ops).push(StoreOp::Set(key.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        self.check_available()?;
        if lock(&self.failing_deletes).contains(key) {
            return Err(Self::injected(key));
        }

        let mut leaves = lock(&self.leaves);
        if leaves.remove(key).is_none() {
            if !Self::is_dir(&leaves, key) {
                return Err(StoreError::NotFound(key.to_string()));
            }
            if !recursive {
                return Err(StoreError::Api {
                    status: 403,
                    code: 102,
                    message: "Not a file".to_string(),
                });
            }
            let prefix = format!("{key}/");
            leaves.retain(|k, _| !k.starts_with(&prefix));
        }

        debug!(key, recursive, "[MOCK] delete");
        lock(&self.ops).push(StoreOp::Delete(key.to_string()));
        Ok(())
    }

    async fn list_children(&self, key: &str) -> Result<Vec<StoreNode>, StoreError> {
        self.check_available()?;
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(Self::injected(key));
        }

        let leaves = lock(&self.leaves);
        Ok(Self::node(&leaves, key)
            .filter(|node| node.dir)
            .map(|node| node.nodes)
            .unwrap_or_default())
    }
}

/// Event source fed from a channel. Dropping the sender ends the stream.
pub struct MockEvents {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<WorkloadEvent, InventoryError>>>>,
    filters: Mutex<Vec<EventFilter>>,
}

impl MockEvents {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<WorkloadEvent, InventoryError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self {
            rx: Mutex::new(Some(rx)),
            filters: Mutex::new(Vec::new()),
        };
        (events, tx)
    }

    /// Filters passed to `subscribe`, in order.
    pub fn filters(&self) -> Vec<EventFilter> {
        lock(&self.filters).clone()
    }

    /// A network connect notification for `container`.
    pub fn connect(container: &str) -> WorkloadEvent {
        WorkloadEvent {
            kind: "network".to_string(),
            action: "connect".to_string(),
            actor_id: "net_mock".to_string(),
            attributes: BTreeMap::from([("container".to_string(), container.to_string())]),
        }
    }
}

#[async_trait]
impl WorkloadEvents for MockEvents {
    async fn subscribe(&self, filter: &EventFilter) -> Result<EventStream, InventoryError> {
        lock(&self.filters).push(filter.clone());

        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| InventoryError::Stream("[MOCK] already subscribed".to_string()))?;

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}
