//! subproxy registrar library
//!
//! Keeps the routing namespace in etcd in sync with the containers that
//! declare a `proxy.domain_names` label. The reverse proxy reads that
//! namespace; the registrar is its only writer.
//!
//! ## Architecture
//!
//! ```text
//! Docker events ─┐
//! interval timer ┼─▶ PassScheduler ─▶ Reconciler ─▶ etcd
//! one-shot ──────┘        (one pass at a time)
//! ```
//!
//! ## Modules
//!
//! - `reconciler`: one fetch-diff-apply-cleanup pass
//! - `trigger`: pass scheduler and the polling/event trigger loops
//! - `daemon`: ties a trigger loop, the scheduler and a shutdown signal together
//! - `docker` / `etcd`: production collaborators
//! - `mock`: in-memory collaborators for tests and local development

pub mod config;
pub mod daemon;
pub mod docker;
pub mod etcd;
pub mod inventory;
pub mod mock;
pub mod reconciler;
pub mod store;
pub mod trigger;

// Re-export commonly used types
pub use daemon::{run_daemon, TriggerMode};
pub use docker::DockerClient;
pub use etcd::EtcdClient;
pub use inventory::{EventFilter, WorkloadEvent, WorkloadEvents, WorkloadInventory};
pub use reconciler::{PassReport, ReconcileError, Reconciler, ReconcilerConfig};
pub use store::{KeyValueStore, StoreError};
pub use trigger::{PassScheduler, SchedulerStats, TriggerError, TriggerHandle};
