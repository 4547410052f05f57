//! Workload runtime interfaces.
//!
//! The registrar needs two things from the container runtime:
//! - A listing of running units filtered by label
//! - A long-lived stream of lifecycle notifications

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;
use subproxy_reconcile::WorkloadUnit;
use thiserror::Error;

/// Errors from the workload runtime.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("runtime unreachable: {0}")]
    Unreachable(String),

    #[error("runtime request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid runtime response: {0}")]
    Decode(String),

    #[error("event stream failed: {0}")]
    Stream(String),
}

/// Server-side filter for lifecycle notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventFilter {
    #[serde(rename = "type", skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    #[serde(rename = "event", skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

impl EventFilter {
    /// Network attach and detach notifications only.
    pub fn network() -> Self {
        Self {
            types: vec!["network".to_string()],
            events: vec!["connect".to_string(), "disconnect".to_string()],
        }
    }

    /// Every network notification.
    pub fn all_network() -> Self {
        Self {
            types: vec!["network".to_string()],
            events: Vec::new(),
        }
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: String,
    pub attributes: BTreeMap<String, String>,
}

impl WorkloadEvent {
    /// Container the notification refers to, when the runtime reports one.
    pub fn container(&self) -> Option<&str> {
        self.attributes.get("container").map(String::as_str)
    }
}

/// Stream of lifecycle notifications; ends when the transport closes.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<WorkloadEvent, InventoryError>> + Send>>;

/// Lists running workload units.
#[async_trait]
pub trait WorkloadInventory: Send + Sync {
    /// List running units that carry `label`.
    async fn list_units(&self, label: &str) -> Result<Vec<WorkloadUnit>, InventoryError>;
}

/// Subscribes to lifecycle notifications.
#[async_trait]
pub trait WorkloadEvents: Send + Sync {
    async fn subscribe(&self, filter: &EventFilter) -> Result<EventStream, InventoryError>;
}
