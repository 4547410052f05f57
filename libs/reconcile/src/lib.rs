//! Convergence primitives for the subproxy namespace.
//!
//! This library turns a workload inventory snapshot into the key-value layout
//! the routing layer reads, and plans the writes and deletes that converge the
//! store towards it. Key concepts:
//!
//! - **Desired state**: one entry per running workload that carries a routing
//!   declaration (the `proxy.domain_names` label).
//! - **Stored state**: the children currently present under the namespace.
//! - **Convergence**: the plan that makes stored match desired.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - An unchanged entry never produces a write
//! - Only names absent from the desired set are ever scheduled for deletion
//!
//! Nothing in this crate performs I/O.

use std::time::Duration;

mod desired;
mod layout;
mod plan;

pub use desired::{sanitize_name, DesiredEntry, DesiredState, NameCollision, WorkloadUnit};
pub use layout::{EntryLayout, Namespace, NamespaceError, StoreNode, StoredEntry};
pub use plan::{ConvergencePlan, ConvergenceStatus, PlannedDelete, PlannedWrite, WriteKind};

/// Label a workload carries to request proxy configuration.
pub const ROUTING_LABEL: &str = "proxy.domain_names";

/// Namespace owned by this system when none is configured.
pub const DEFAULT_NAMESPACE: &str = "/subproxies";

/// Default polling interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
