//! Remote document store contract.
//!
//! The store owns transport, query execution and persistence. The engine only
//! needs push subscriptions plus merge-writes and deletes:
//!
//! ```text
//! subscribe(query)          ──► stream of Result<ChangeBatch>
//! subscribe_document(doc)   ──► stream of Result<Option<DocumentSnapshot>>
//! write_document(doc, fields, merge)
//! delete_document(doc)
//! ```
//!
//! A subscription ends when its receiver is dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{ChangeBatch, DocumentRef, DocumentSnapshot, Fields, Query};

/// One push on a collection subscription.
pub type CollectionPush = Result<ChangeBatch, StoreError>;

/// One push on a document subscription. `Ok(None)`: the document does not exist.
pub type DocumentPush = Result<Option<DocumentSnapshot>, StoreError>;

pub type CollectionSubscription = mpsc::UnboundedReceiver<CollectionPush>;
pub type DocumentSubscription = mpsc::UnboundedReceiver<DocumentPush>;

/// A push-notified, queryable document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to a query. The first push is the current result set,
    /// every document reported as `Added`.
    async fn subscribe(&self, query: &Query) -> Result<CollectionSubscription, StoreError>;

    /// Subscribe to one document. The first push is its current state.
    async fn subscribe_document(&self, doc: &DocumentRef)
        -> Result<DocumentSubscription, StoreError>;

    /// Write `fields` to `doc`. With `merge`, only the supplied top-level
    /// fields are overwritten; otherwise the document is replaced.
    async fn write_document(
        &self,
        doc: &DocumentRef,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// Delete `doc`. Deleting a missing document succeeds.
    async fn delete_document(&self, doc: &DocumentRef) -> Result<(), StoreError>;
}

/// Errors reported by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Addressed document or collection does not exist
    NotFound(String),
    /// Caller is not allowed to perform the operation
    PermissionDenied(String),
    /// Backend unreachable
    Unavailable(String),
    /// Malformed request
    InvalidArgument(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(e) => write!(f, "Not found: {e}"),
            StoreError::PermissionDenied(e) => write!(f, "Permission denied: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::InvalidArgument(e) => write!(f, "Invalid argument: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
