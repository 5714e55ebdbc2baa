//! Error type shared by the synchronizer and the mirror.

use crate::store::StoreError;

/// Errors surfaced by sync operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The item has no identity, so it cannot be addressed remotely
    MissingIdentity,
    /// A local cache index outside `0..len`
    IndexOutOfRange { index: usize, len: usize },
    /// No collection is bound to write to
    NotBound,
    /// `start()` was called with no query bound
    NoQuery,
    /// A remote payload did not match the expected shape
    Decode(String),
    /// A local value could not be encoded as a document
    Encode(String),
    /// The mirror holds no value to write back
    NothingToCommit,
    /// Transport or permission error reported by the store
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentity => write!(f, "Item has no identity"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "Index {index} out of range for cache of {len} items")
            }
            Self::NotBound => write!(f, "No collection bound"),
            Self::NoQuery => write!(f, "No query bound; call attach() before start()"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::NothingToCommit => write!(f, "Nothing to commit"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}
