//! # tether-sync — live, ordered mirrors of remote documents
//!
//! Keeps a locally cached copy of a remote query (or of one remote document)
//! up to date from the store's push notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ChangeBatch pushes  ┌────────────────┐
//! │ RemoteStore  │ ───────────────────► │ CollectionSync │──► on_event / on_batch
//! │ (injected)   │                      │ OrderedCache   │
//! │              │  DocumentSnapshot    ├────────────────┤
//! │              │ ───────────────────► │ DocumentMirror │──► on_change
//! └──────▲───────┘                      └───────┬────────┘
//!        │        write / delete (merge)        │
//!        └──────────────────────────────────────┘
//! ```
//!
//! Every instance applies pushes through its own [`dispatch`] gate, so
//! observers are never invoked concurrently and never after `stop()` returns.
//!
//! ## Modules
//!
//! - [`item`] — identity/order/codec contract for synchronized values
//! - [`protocol`] — change batches, snapshots, references and queries
//! - [`store`] — the remote document store contract
//! - [`memory`] — in-process store with query evaluation and fan-out
//! - [`cache`] — sorted, identity-unique local cache
//! - [`dispatch`] — per-instance serialized dispatch and dispatch targets
//! - [`collection`] — ordered collection synchronizer
//! - [`mirror`] — single-document mirror

pub mod cache;
pub mod collection;
pub mod dispatch;
pub mod error;
pub mod item;
pub mod memory;
pub mod mirror;
pub mod protocol;
pub mod store;

// Re-exports for convenience
pub use cache::OrderedCache;
pub use collection::{
    CollectionSync, CommitStrategy, MergeWriteThrough, NoCommit, SyncConfig, SyncStats,
};
pub use dispatch::Dispatch;
pub use error::SyncError;
pub use item::{Identifiable, Record, SyncItem};
pub use memory::{MemoryStore, StoreStats, WriteRecord};
pub use mirror::{DocumentMirror, MirrorState, MirrorStatus};
pub use protocol::{
    ChangeBatch, ChangeKind, CollectionRef, DocumentChange, DocumentRef, DocumentSnapshot,
    Fields, Filter, FilterOp, Query,
};
pub use store::{
    CollectionPush, CollectionSubscription, DocumentPush, DocumentSubscription, RemoteStore,
    StoreError,
};
