//! Desired-state derivation from a workload inventory snapshot.

use std::collections::BTreeMap;

use crate::layout::{EntryLayout, Namespace};
use crate::ROUTING_LABEL;

/// A running workload as reported by the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadUnit {
    /// Runtime-assigned identifier.
    pub id: String,

    /// Human-readable names; the first one is the primary name.
    pub names: Vec<String>,

    /// Metadata labels.
    pub labels: BTreeMap<String, String>,
}

impl WorkloadUnit {
    /// Create a unit with a single name and no labels.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            names: vec![name.into()],
            labels: BTreeMap::new(),
        }
    }

    /// Attach a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The primary declared name, if any.
    pub fn primary_name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    /// The routing declaration, present only when the label is non-blank.
    pub fn routing_declaration(&self) -> Option<&str> {
        self.labels
            .get(ROUTING_LABEL)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Strip leading path separators so a runtime name can be used as a key segment.
pub fn sanitize_name(name: &str) -> &str {
    name.trim_start_matches('/')
}

/// An entry the store should hold after the next successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredEntry {
    /// Sanitized unit name (the configured name).
    pub name: String,

    /// Full store key the value is written to.
    pub key: String,

    /// Encoded value.
    pub value: String,

    /// Unit the entry was derived from.
    pub unit_id: String,
}

/// Two units that sanitized to the same name; the later one won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub name: String,
    pub replaced_unit: String,
    pub winner_unit: String,
}

/// The full desired set for one pass.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    entries: BTreeMap<String, DesiredEntry>,

    /// Units whose sanitized names clashed. Last write wins in inventory order.
    pub collisions: Vec<NameCollision>,

    /// Ids of units that declared routing but have no usable name.
    pub skipped: Vec<String>,
}

impl DesiredState {
    /// Derive desired entries from an inventory snapshot.
    ///
    /// Units without a routing declaration contribute nothing. A unit whose
    /// sanitized primary name is empty or still contains a separator cannot be
    /// addressed as a single child of the namespace and is skipped.
    pub fn build(namespace: &Namespace, layout: EntryLayout, units: &[WorkloadUnit]) -> Self {
        let mut state = Self::default();

        for unit in units {
            let Some(declaration) = unit.routing_declaration() else {
                continue;
            };

            let name = unit.primary_name().map(sanitize_name).unwrap_or_default();
            if name.is_empty() || name.contains('/') {
                state.skipped.push(unit.id.clone());
                continue;
            }

            let entry = DesiredEntry {
                name: name.to_string(),
                key: layout.key_for(namespace, name),
                value: layout.value_for(name, declaration),
                unit_id: unit.id.clone(),
            };

            if let Some(previous) = state.entries.insert(name.to_string(), entry) {
                state.collisions.push(NameCollision {
                    name: name.to_string(),
                    replaced_unit: previous.unit_id,
                    winner_unit: unit.id.clone(),
                });
            }
        }

        state
    }

    /// Whether a sanitized name is configured in this pass.
    pub fn is_configured(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Look up the entry for a configured name.
    pub fn get(&self, name: &str) -> Option<&DesiredEntry> {
        self.entries.get(name)
    }

    /// Entries ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = &DesiredEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
