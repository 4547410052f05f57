//! Convergence planning: the diff between desired and stored entries.

use crate::desired::{DesiredEntry, DesiredState};
use crate::layout::{EntryLayout, StoredEntry};

/// Convergence status of the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Stored state already matches desired state.
    Converged,

    /// Writes or deletes are pending.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if nothing needs to change.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Why an entry is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// No child exists for the name.
    Create,

    /// The child exists with a different value.
    Update,

    /// The child exists with the wrong shape for the layout (file vs.
    /// directory) and must be removed before writing.
    Replace,

    /// The stored state is unknown; write unconditionally.
    Overwrite,
}

/// A write scheduled by the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    pub kind: WriteKind,
    pub entry: DesiredEntry,
}

/// A namespace child scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelete {
    pub name: String,
    pub key: String,
    pub recursive: bool,
}

/// Writes and deletes that converge the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergencePlan {
    /// Writes in name order.
    pub writes: Vec<PlannedWrite>,

    /// Deletes for children whose name is not configured.
    pub deletes: Vec<PlannedDelete>,

    /// Desired entries already stored with the right value.
    pub unchanged: usize,
}

impl ConvergencePlan {
    /// Diff desired entries against a snapshot of the namespace.
    pub fn compute(desired: &DesiredState, layout: EntryLayout, stored: &[StoredEntry]) -> Self {
        let mut plan = Self::default();

        for entry in desired.entries() {
            let current = stored.iter().find(|s| s.name == entry.name);
            let kind = match current {
                None => Some(WriteKind::Create),
                Some(s) if s.is_dir != layout.is_nested() => Some(WriteKind::Replace),
                Some(s) if s.value.as_deref() == Some(entry.value.as_str()) => None,
                Some(_) => Some(WriteKind::Update),
            };

            match kind {
                Some(kind) => plan.writes.push(PlannedWrite {
                    kind,
                    entry: entry.clone(),
                }),
                None => plan.unchanged += 1,
            }
        }

        for s in stored {
            if desired.is_configured(&s.name) {
                continue;
            }
            // Duplicate listing entries must not produce duplicate deletes.
            if plan.deletes.iter().any(|d| d.key == s.key) {
                continue;
            }
            plan.deletes.push(PlannedDelete {
                name: s.name.clone(),
                key: s.key.clone(),
                recursive: s.is_dir,
            });
        }

        plan
    }

    /// A plan that rewrites every desired entry and deletes nothing.
    ///
    /// Used when the namespace could not be read.
    pub fn overwrite_all(desired: &DesiredState) -> Self {
        Self {
            writes: desired
                .entries()
                .map(|entry| PlannedWrite {
                    kind: WriteKind::Overwrite,
                    entry: entry.clone(),
                })
                .collect(),
            deletes: Vec::new(),
            unchanged: 0,
        }
    }

    pub fn status(&self) -> ConvergenceStatus {
        if self.writes.is_empty() && self.deletes.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// Number of writes of the given kind.
    pub fn count(&self, kind: WriteKind) -> usize {
        self.writes.iter().filter(|w| w.kind == kind).count()
    }
}
