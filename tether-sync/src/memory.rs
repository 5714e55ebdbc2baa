//! In-process [`RemoteStore`].
//!
//! Holds documents in memory, evaluates [`Query`] filters and fans every
//! mutation out to the matching subscriptions:
//!
//! ```text
//! write_document(doc) ──► documents[collection][id]
//!                     ├─► query subscribers of `collection`
//!                     │     Added    (now matches, did not before)
//!                     │     Modified (matched before and after)
//!                     │     Removed  (matched before, not anymore)
//!                     └─► document subscribers of `doc`
//! ```
//!
//! Closed subscriptions are pruned on the next send. `emit` and
//! `emit_document` push raw payloads without touching stored documents,
//! and `fail_next` makes the next write or delete fail.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dispatch::lock;
use crate::protocol::{
    ChangeBatch, CollectionRef, DocumentChange, DocumentRef, DocumentSnapshot, Fields, Query,
};
use crate::store::{
    CollectionPush, CollectionSubscription, DocumentPush, DocumentSubscription, RemoteStore,
    StoreError,
};

/// Statistics for inspecting store traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub writes: u64,
    pub deletes: u64,
    pub pushes_sent: u64,
    pub active_subscriptions: usize,
}

/// A mutation accepted by the store, in order of arrival.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Write {
        doc: DocumentRef,
        fields: Fields,
        merge: bool,
    },
    Delete {
        doc: DocumentRef,
    },
}

impl WriteRecord {
    pub fn doc(&self) -> &DocumentRef {
        match self {
            WriteRecord::Write { doc, .. } | WriteRecord::Delete { doc } => doc,
        }
    }
}

struct QuerySubscriber {
    id: Uuid,
    query: Query,
    /// Ids currently in this subscriber's result set.
    visible: BTreeSet<String>,
    tx: mpsc::UnboundedSender<CollectionPush>,
}

struct DocumentSubscriber {
    id: Uuid,
    doc: DocumentRef,
    tx: mpsc::UnboundedSender<DocumentPush>,
}

#[derive(Default)]
struct StoreState {
    /// collection path → id → fields (ids kept sorted for stable initial pushes)
    collections: HashMap<String, BTreeMap<String, Fields>>,
    queries: Vec<QuerySubscriber>,
    documents: Vec<DocumentSubscriber>,
    failures: VecDeque<StoreError>,
    log: Vec<WriteRecord>,
}

struct AtomicStoreStats {
    writes: AtomicU64,
    deletes: AtomicU64,
    pushes_sent: AtomicU64,
}

/// In-memory document store with push subscriptions.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    stats: AtomicStoreStats,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            stats: AtomicStoreStats {
                writes: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
                pushes_sent: AtomicU64::new(0),
            },
        }
    }

    /// Current fields of `doc`, if it exists.
    pub fn document(&self, doc: &DocumentRef) -> Option<Fields> {
        let state = lock(&self.state);
        state
            .collections
            .get(doc.collection().path())
            .and_then(|docs| docs.get(doc.id()))
            .cloned()
    }

    /// All documents of a collection, ordered by id.
    pub fn documents(&self, collection: &CollectionRef) -> Vec<DocumentSnapshot> {
        let state = lock(&self.state);
        state
            .collections
            .get(collection.path())
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| DocumentSnapshot::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every accepted write and delete so far.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.state).log.clone()
    }

    /// Make the next write or delete fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, error: StoreError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Push a raw batch to every open query subscription on `collection`,
    /// bypassing stored documents. Returns the number of receivers.
    pub fn emit(&self, collection: &CollectionRef, push: CollectionPush) -> usize {
        let mut state = lock(&self.state);
        let mut delivered = 0;
        state.queries.retain(|sub| {
            if sub.query.collection != *collection {
                return true;
            }
            let open = sub.tx.send(push.clone()).is_ok();
            delivered += usize::from(open);
            open
        });
        self.stats
            .pushes_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Push a raw payload to every open subscription on `doc`.
    pub fn emit_document(&self, doc: &DocumentRef, push: DocumentPush) -> usize {
        let mut state = lock(&self.state);
        let mut delivered = 0;
        state.documents.retain(|sub| {
            if sub.doc != *doc {
                return true;
            }
            let open = sub.tx.send(push.clone()).is_ok();
            delivered += usize::from(open);
            open
        });
        self.stats
            .pushes_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of open subscriptions (closed ones are counted until pruned).
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.queries.retain(|sub| !sub.tx.is_closed());
        state.documents.retain(|sub| !sub.tx.is_closed());
        state.queries.len() + state.documents.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            pushes_sent: self.stats.pushes_sent.load(Ordering::Relaxed),
            active_subscriptions: self.subscriber_count(),
        }
    }

    /// Fan a document change out to query and document subscribers.
    ///
    /// `fields` is `None` when the document was deleted.
    fn notify(&self, state: &mut StoreState, doc: &DocumentRef, fields: Option<&Fields>) {
        let mut sent = 0u64;
        let snapshot = |fields: &Fields| DocumentSnapshot::new(doc.id(), fields.clone());

        state.queries.retain_mut(|sub| {
            if sub.query.collection != *doc.collection() {
                return true;
            }
            let was_visible = sub.visible.contains(doc.id());
            let now_visible = fields.is_some_and(|f| sub.query.matches(f));
            let change = match (was_visible, now_visible, fields) {
                (false, true, Some(f)) => DocumentChange::added(snapshot(f)),
                (true, true, Some(f)) => DocumentChange::modified(snapshot(f)),
                (true, false, Some(f)) => DocumentChange::removed(snapshot(f)),
                (true, false, None) => {
                    DocumentChange::removed(DocumentSnapshot::new(doc.id(), Fields::new()))
                }
                _ => return true,
            };
            if now_visible {
                sub.visible.insert(doc.id().to_string());
            } else {
                sub.visible.remove(doc.id());
            }
            let open = sub.tx.send(Ok(ChangeBatch::new(vec![change]))).is_ok();
            if open {
                sent += 1;
            } else {
                log::debug!("MemoryStore: pruning closed query subscription {}", sub.id);
            }
            open
        });

        state.documents.retain(|sub| {
            if sub.doc != *doc {
                return true;
            }
            let open = sub.tx.send(Ok(fields.map(snapshot))).is_ok();
            if open {
                sent += 1;
            } else {
                log::debug!("MemoryStore: pruning closed document subscription {}", sub.id);
            }
            open
        });

        self.stats.pushes_sent.fetch_add(sent, Ordering::Relaxed);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn subscribe(&self, query: &Query) -> Result<CollectionSubscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);

        let initial: ChangeBatch = state
            .collections
            .get(query.collection.path())
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.matches(fields))
                    .map(|(id, fields)| {
                        DocumentChange::added(DocumentSnapshot::new(id.clone(), fields.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let visible = initial.iter().map(|c| c.id().to_string()).collect();

        // The receiver is still in hand, so this send cannot fail.
        let _ = tx.send(Ok(initial));
        self.stats.pushes_sent.fetch_add(1, Ordering::Relaxed);

        let id = Uuid::new_v4();
        log::debug!("MemoryStore: query subscription {id} on {}", query.collection);
        state.queries.push(QuerySubscriber {
            id,
            query: query.clone(),
            visible,
            tx,
        });
        Ok(rx)
    }

    async fn subscribe_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<DocumentSubscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);

        let current = state
            .collections
            .get(doc.collection().path())
            .and_then(|docs| docs.get(doc.id()))
            .map(|fields| DocumentSnapshot::new(doc.id(), fields.clone()));
        let _ = tx.send(Ok(current));
        self.stats.pushes_sent.fetch_add(1, Ordering::Relaxed);

        let id = Uuid::new_v4();
        log::debug!("MemoryStore: document subscription {id} on {doc}");
        state.documents.push(DocumentSubscriber {
            id,
            doc: doc.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn write_document(
        &self,
        doc: &DocumentRef,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if doc.id().is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "empty document id in {}",
                doc.collection()
            )));
        }

        state.log.push(WriteRecord::Write {
            doc: doc.clone(),
            fields: fields.clone(),
            merge,
        });

        let stored = {
            let docs = state
                .collections
                .entry(doc.collection().path().to_string())
                .or_default();
            let entry = docs.entry(doc.id().to_string()).or_default();
            if merge {
                entry.extend(fields);
            } else {
                *entry = fields;
            }
            entry.clone()
        };
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        self.notify(&mut state, doc, Some(&stored));
        Ok(())
    }

    async fn delete_document(&self, doc: &DocumentRef) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.log.push(WriteRecord::Delete { doc: doc.clone() });
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);

        let existed = state
            .collections
            .get_mut(doc.collection().path())
            .and_then(|docs| docs.remove(doc.id()))
            .is_some();
        if existed {
            self.notify(&mut state, doc, None);
        }
        Ok(())
    }
}
