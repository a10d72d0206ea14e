use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::SchemaFields;

/// Failure taxonomy for all remote calls.
///
/// Callers use [`RemoteError::is_retryable`] to decide between blind retry
/// and surfacing the failure; `SchemaConflict` is produced only by schema
/// provisioning and is treated as success by its caller.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure: DNS, refused connection, timeout.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// The remote store answered with an error status.
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The remote answered but the body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Collection or field already exists.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
}

impl RemoteError {
    /// Whether a caller may retry this failure without operator input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Malformed(_) | Self::SchemaConflict(_) => false,
        }
    }
}

/// A collection (named record schema) in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    /// Names of the fields the remote schema currently has.
    pub field_names: HashSet<String>,
}

/// Minimal projection row returned by reconciliation queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRow {
    pub connector_id: String,
    pub timestamp: String,
}

/// The remote store's administrative and query API.
///
/// One implementation talks HTTP to the real store; tests substitute
/// in-memory fakes with fault injection.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List collections whose name carries the reserved prefix.
    async fn list_collections(&self, prefix: &str) -> Result<Vec<CollectionInfo>, RemoteError>;

    async fn create_collection(
        &self,
        name: &str,
        fields: &SchemaFields,
    ) -> Result<CollectionInfo, RemoteError>;

    /// Additive-only schema patch: adds the given fields, never removes or
    /// retypes existing ones.
    async fn patch_collection(
        &self,
        collection_id: &str,
        fields: &SchemaFields,
    ) -> Result<(), RemoteError>;

    /// Insert one serialized record directly (direct-HTTP delivery mode).
    async fn insert_record(&self, collection_id: &str, payload: &str) -> Result<(), RemoteError>;

    /// Query `(connector, timestamp)` pairs in `[start, end)` with minimal
    /// field projection. Used only by reconciliation.
    async fn query_window(
        &self,
        collection_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Upload a named blob to the durable object store (gap audit batches).
    async fn upload_blob(&self, name: &str, bytes: Vec<u8>) -> Result<(), RemoteError>;
}

/// Best-effort publish transport (message bus).
///
/// The transport gives no delivery acknowledgment; at-least-once is
/// reconstructed by the reconciliation engine on top of it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: &str) -> Result<(), RemoteError>;

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteError::Connectivity("timeout".into()).is_retryable());
        assert!(RemoteError::Rejected { status: 503, message: "busy".into() }.is_retryable());
        assert!(!RemoteError::Rejected { status: 400, message: "bad".into() }.is_retryable());
        assert!(!RemoteError::Malformed("not json".into()).is_retryable());
        assert!(!RemoteError::SchemaConflict("exists".into()).is_retryable());
    }
}
