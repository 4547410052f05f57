//! Reconciler for converging the routing namespace.
//!
//! One pass:
//! - Lists running units that carry the routing label
//! - Derives the desired entries and reads the namespace
//! - Writes created and changed entries (stops at the first failed write)
//! - Deletes children whose unit is no longer configured
//!
//! The reconciler is the only component that touches the store. Passes are
//! serialized by the scheduler; `reconcile` itself assumes no concurrent pass.

use std::sync::Arc;
use std::time::Instant;

use subproxy_reconcile::{
    ConvergencePlan, DesiredState, EntryLayout, Namespace, PlannedWrite, StoredEntry, WriteKind,
    ROUTING_LABEL,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::inventory::{InventoryError, WorkloadInventory};
use crate::store::{KeyValueStore, StoreError};

/// Errors that end a pass early. All of them are recoverable: the next
/// trigger retries from scratch.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("workload inventory unavailable: {0}")]
    Inventory(#[from] InventoryError),

    #[error("failed to write {key} for {name}: {source}")]
    Write {
        name: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read {namespace}, stale entries were not cleaned up: {source}")]
    CleanupRead {
        namespace: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to delete {} stale entries: {}", .keys.len(), .keys.join(", "))]
    Cleanup { keys: Vec<String> },
}

/// Reconciler configuration.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    /// Namespace owned by this reconciler.
    pub namespace: Namespace,

    /// Encoding of entries under the namespace.
    pub layout: EntryLayout,
}

/// What a successful pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub collisions: usize,
}

impl PassReport {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// Reconciler for the routing namespace.
pub struct Reconciler {
    inventory: Arc<dyn WorkloadInventory>,
    store: Arc<dyn KeyValueStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler over explicit collaborators.
    pub fn new(
        inventory: Arc<dyn WorkloadInventory>,
        store: Arc<dyn KeyValueStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            inventory,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile(&self) -> Result<PassReport, ReconcileError> {
        let started = Instant::now();
        let namespace = &self.config.namespace;
        let layout = self.config.layout;

        debug!(namespace = %namespace, "Starting reconciliation");

        let units = match self.inventory.list_units(ROUTING_LABEL).await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "Failed to fetch workload inventory, store left untouched");
                return Err(e.into());
            }
        };

        let desired = DesiredState::build(namespace, layout, &units);
        for collision in &desired.collisions {
            warn!(
                name = %collision.name,
                replaced_unit = %collision.replaced_unit,
                winner_unit = %collision.winner_unit,
                "Units share a name, keeping the last one"
            );
        }
        for unit_id in &desired.skipped {
            warn!(unit_id = %unit_id, "Unit declares routing but has no usable name, skipping");
        }

        let (plan, read_error) = match self.store.list_children(namespace.as_str()).await {
            Ok(children) => {
                let stored = StoredEntry::decode(namespace, layout, &children);
                (ConvergencePlan::compute(&desired, layout, &stored), None)
            }
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    error = %e,
                    "Failed to read namespace, rewriting all desired entries"
                );
                (ConvergencePlan::overwrite_all(&desired), Some(e))
            }
        };

        let mut report = PassReport {
            unchanged: plan.unchanged,
            collisions: desired.collisions.len(),
            ..PassReport::default()
        };

        if plan.status().is_converged() && read_error.is_none() {
            debug!(
                entries = desired.len(),
                units = units.len(),
                "Namespace already converged"
            );
            return Ok(report);
        }

        for write in &plan.writes {
            self.apply_write(write).await?;
            match write.kind {
                WriteKind::Create => report.created += 1,
                WriteKind::Update | WriteKind::Replace | WriteKind::Overwrite => {
                    report.updated += 1
                }
            }
        }

        if let Some(source) = read_error {
            return Err(ReconcileError::CleanupRead {
                namespace: namespace.to_string(),
                source,
            });
        }

        let mut failed = Vec::new();
        for delete in &plan.deletes {
            match self.store.delete(&delete.key, delete.recursive).await {
                Ok(()) => {
                    info!(name = %delete.name, key = %delete.key, "Removed stale entry");
                    report.deleted += 1;
                }
                Err(e) if e.is_not_found() => {
                    debug!(key = %delete.key, "Stale entry already gone");
                }
                Err(e) => {
                    error!(
                        name = %delete.name,
                        key = %delete.key,
                        error = %e,
                        "Failed to remove stale entry"
                    );
                    failed.push(delete.key.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(ReconcileError::Cleanup { keys: failed });
        }

        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reconciliation pass complete"
        );

        Ok(report)
    }

    async fn apply_write(&self, write: &PlannedWrite) -> Result<(), ReconcileError> {
        let entry = &write.entry;
        let write_error = |source: StoreError| {
            error!(
                name = %entry.name,
                key = %entry.key,
                error = %source,
                "Failed to write entry, aborting pass"
            );
            ReconcileError::Write {
                name: entry.name.clone(),
                key: entry.key.clone(),
                source,
            }
        };

        if write.kind == WriteKind::Replace {
            let child = self.config.namespace.child_key(&entry.name);
            match self.store.delete(&child, true).await {
                Ok(()) => debug!(key = %child, "Removed entry with outdated layout"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(write_error(e)),
            }
        }

        self.store
            .set(&entry.key, &entry.value)
            .await
            .map_err(write_error)?;

        info!(
            name = %entry.name,
            key = %entry.key,
            unit_id = %entry.unit_id,
            kind = ?write.kind,
            "Wrote entry"
        );
        Ok(())
    }
}
