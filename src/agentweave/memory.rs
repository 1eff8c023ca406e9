//! Consumed shared-memory interface.
//!
//! Iterative pipelines persist every stage's *full* output into a shared
//! memory namespace and hand downstream agents only a size-bounded summary
//! plus the key needed to fetch the rest (hybrid context passing).  The
//! storage backend itself is out of scope; the engine consumes this minimal
//! put/list/delete surface.

use crate::agentweave::agent_api::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Namespace under which workflow stage outputs are stored.
pub const WORKFLOW_NAMESPACE: &str = "workflow";

/// One value to persist.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    /// Namespace the key lives in; executors always use [`WORKFLOW_NAMESPACE`].
    pub namespace: String,
    /// Key, e.g. `"stage-2-output"`.
    pub key: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Id of the agent that produced the value.
    pub agent_id: String,
    /// Free-form metadata (executors tag entries with a timestamp).
    pub metadata: HashMap<String, String>,
}

/// Trait defining the shared-memory surface the engine consumes.
#[async_trait]
pub trait SharedMemory: Send + Sync {
    /// Store an entry, overwriting any previous value for the same key.
    async fn put(&self, entry: MemoryEntry) -> Result<(), BoxError>;

    /// List the keys currently present in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<String>, BoxError>;

    /// Delete one key from a namespace.  Deleting an absent key is an error
    /// or a no-op at the implementation's discretion; the engine logs and
    /// continues either way.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), BoxError>;
}
