//! Key-value store interface.

use std::time::Duration;

use async_trait::async_trait;
use subproxy_reconcile::StoreNode;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("store API error {status} (code {code}): {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
    },

    #[error("invalid store response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether another endpoint might succeed where this one failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

/// Hierarchical key-value store holding the routing namespace.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single node.
    async fn get(&self, key: &str) -> Result<StoreNode, StoreError>;

    /// Create or overwrite a value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a key, and its subtree when `recursive` is set.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError>;

    /// Immediate children of `key` with their subtrees. A missing key lists as
    /// empty.
    async fn list_children(&self, key: &str) -> Result<Vec<StoreNode>, StoreError>;
}
