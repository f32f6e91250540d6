//! Capability contract for policy-evaluation backends.
//!
//! The sync engine only ever talks to a store through [`PolicyStore`];
//! concrete backends (an embedded engine, a sidecar agent, the in-memory
//! reference store) implement the full trait and own their consistency
//! guarantees. The trait is object-safe so stores can be shared as
//! `Arc<dyn PolicyStore>` across runners.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One policy source module inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyModule {
    /// Module id, unique within the bundle (usually its source path).
    pub id: String,
    pub code: String,
}

/// A versioned snapshot of policy code (and optionally static data) for
/// one or more directories, as returned by the fetch collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyBundle {
    /// Directories this bundle covers.
    pub directories: Vec<String>,
    pub modules: Vec<PolicyModule>,
    /// Static data to apply at the data root, if the bundle carries any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Content hash reported by the server; doubles as the policy version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// An authorization question posed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationQuery {
    pub user: String,
    pub action: String,
    #[serde(default)]
    pub resource: Value,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub allow: bool,
    /// Raw backend result, for callers that need more than the verdict.
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("invalid data path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// The full operation set any concrete policy store must expose.
///
/// All operations are asynchronous and may fail with a backend-specific
/// [`StoreError`]. The engine never depends on behavior beyond these
/// signatures; in particular [`set_policies`](PolicyStore::set_policies)
/// must be idempotent — applying the same bundle twice leaves the store
/// in the same observable state as applying it once.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn is_allowed(&self, query: &AuthorizationQuery)
        -> Result<AuthorizationDecision, StoreError>;

    async fn set_policy(&self, id: &str, code: &str) -> Result<(), StoreError>;

    async fn get_policy(&self, id: &str) -> Result<Option<String>, StoreError>;

    async fn delete_policy(&self, id: &str) -> Result<(), StoreError>;

    async fn list_policy_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Bulk-apply a bundle: upsert every module it carries and, when the
    /// bundle includes static data, replace the data root with it.
    async fn set_policies(&self, bundle: &PolicyBundle) -> Result<(), StoreError>;

    async fn get_policy_version(&self) -> Result<Option<String>, StoreError>;

    /// Write `data` at `path` (slash-separated; empty means the root).
    async fn set_policy_data(&self, data: Value, path: &str) -> Result<(), StoreError>;

    /// Read the value at `path`; absent paths read as JSON null.
    async fn get_data(&self, path: &str) -> Result<Value, StoreError>;
}
