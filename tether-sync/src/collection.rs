//! Ordered collection synchronizer.
//!
//! Binds to a remote query, applies every pushed [`ChangeBatch`] to an
//! [`OrderedCache`] and notifies observers:
//!
//! ```text
//! push ──► for each change (arrival order)
//!            decode ── fail ──► dropped, counted, warn
//!              │
//!              ▼
//!            cache.apply() ──► on_event(kind, &item)
//!          after the batch ──► on_batch(&decoded_items)
//! ```
//!
//! Local mutations go straight to the store; the cache only changes when the
//! store pushes the result back.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

use crate::cache::OrderedCache;
use crate::dispatch::{lock, Dispatch, DispatchGate, ObserverSet};
use crate::error::SyncError;
use crate::item::{decode_item, encode_fields, SyncItem};
use crate::protocol::{ChangeBatch, ChangeKind, CollectionRef, Query};
use crate::store::{CollectionPush, CollectionSubscription, RemoteStore};

/// Configuration for a [`CollectionSync`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Where the listener task runs
    pub dispatch: Dispatch,
    /// Log every applied batch at debug level
    pub log_batches: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dispatch: Dispatch::Current,
            log_batches: false,
        }
    }
}

impl SyncConfig {
    /// Verbose config for tests.
    pub fn for_testing() -> Self {
        Self {
            dispatch: Dispatch::Current,
            log_batches: true,
        }
    }
}

/// Counters for an individual synchronizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub batches_applied: u64,
    pub events_applied: u64,
    pub decode_failures: u64,
}

#[derive(Default)]
struct AtomicSyncStats {
    batches_applied: AtomicU64,
    events_applied: AtomicU64,
    decode_failures: AtomicU64,
}

impl AtomicSyncStats {
    fn snapshot(&self) -> SyncStats {
        SyncStats {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Write-back policy for locally edited items.
///
/// Every method defaults to doing nothing.
#[async_trait]
pub trait CommitStrategy<T: SyncItem>: Send + Sync {
    async fn commit_all(&self, _sync: &CollectionSync<T>) -> Result<(), SyncError> {
        Ok(())
    }

    async fn commit_at(&self, _sync: &CollectionSync<T>, _index: usize) -> Result<(), SyncError> {
        Ok(())
    }

    async fn commit(&self, _sync: &CollectionSync<T>, _item: &T) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Commits are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommit;

impl<T: SyncItem> CommitStrategy<T> for NoCommit {}

/// Commits merge-write items through [`CollectionSync::insert`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeWriteThrough;

#[async_trait]
impl<T: SyncItem> CommitStrategy<T> for MergeWriteThrough {
    async fn commit_all(&self, sync: &CollectionSync<T>) -> Result<(), SyncError> {
        for item in sync.items() {
            sync.insert(&item).await?;
        }
        Ok(())
    }

    async fn commit_at(&self, sync: &CollectionSync<T>, index: usize) -> Result<(), SyncError> {
        let item = sync.get(index).ok_or(SyncError::IndexOutOfRange {
            index,
            len: sync.len(),
        })?;
        sync.insert(&item).await
    }

    async fn commit(&self, sync: &CollectionSync<T>, item: &T) -> Result<(), SyncError> {
        sync.insert(item).await
    }
}

type EventObserver<T> = dyn FnMut(ChangeKind, &T) + Send;
type BatchObserver<T> = dyn FnMut(&[T]) + Send;

struct State<T> {
    cache: OrderedCache<T>,
    collection: Option<CollectionRef>,
    query: Option<Query>,
    listener: Option<JoinHandle<()>>,
}

struct Shared<T: SyncItem> {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    gate: DispatchGate,
    state: Mutex<State<T>>,
    event_observers: ObserverSet<EventObserver<T>>,
    batch_observers: ObserverSet<BatchObserver<T>>,
    strategy: Arc<dyn CommitStrategy<T>>,
    stats: AtomicSyncStats,
}

/// Keeps an ordered local cache in sync with a remote query.
///
/// Cloning yields another handle to the same synchronizer.
pub struct CollectionSync<T: SyncItem> {
    shared: Arc<Shared<T>>,
}

impl<T: SyncItem> Clone for CollectionSync<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: SyncItem> CollectionSync<T> {
    /// Unbound synchronizer with the no-op commit strategy.
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self::with_strategy(store, config, Arc::new(NoCommit))
    }

    pub fn with_strategy(
        store: Arc<dyn RemoteStore>,
        config: SyncConfig,
        strategy: Arc<dyn CommitStrategy<T>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                config,
                gate: DispatchGate::new(),
                state: Mutex::new(State {
                    cache: OrderedCache::new(),
                    collection: None,
                    query: None,
                    listener: None,
                }),
                event_observers: ObserverSet::new(),
                batch_observers: ObserverSet::new(),
                strategy,
                stats: AtomicSyncStats::default(),
            }),
        }
    }

    /// Synchronizer already bound to `collection`.
    pub fn with_source(
        store: Arc<dyn RemoteStore>,
        collection: CollectionRef,
        query: Option<Query>,
        config: SyncConfig,
    ) -> Self {
        let sync = Self::new(store, config);
        sync.attach(collection, query);
        sync
    }

    /// Bind to `collection`, listening to `query` (the whole collection when
    /// `None`). Stops any running listener and clears the cache.
    pub fn attach(&self, collection: CollectionRef, query: Option<Query>) {
        self.stop();
        let query = query.unwrap_or_else(|| Query::collection(collection.clone()));
        if query.collection != collection {
            log::warn!(
                "CollectionSync: query on {} but writes go to {}",
                query.collection,
                collection
            );
        }
        let mut state = lock(&self.shared.state);
        state.collection = Some(collection);
        state.query = Some(query);
    }

    /// Subscribe to the bound query.
    ///
    /// Resolves once the store's initial result set has been applied. Later
    /// pushes are applied by a listener task on the configured dispatch
    /// target. Restarts the listener if one is running.
    pub async fn start(&self) -> Result<(), SyncError> {
        let query = lock(&self.shared.state).query.clone();
        let Some(query) = query else {
            log::error!("CollectionSync::start() called with no query bound; call attach() first");
            return Err(SyncError::NoQuery);
        };

        self.stop();
        let generation = self.shared.gate.current();
        let mut rx = self.shared.store.subscribe(&query).await?;

        if let Some(push) = rx.recv().await {
            self.shared.process(generation, push);
        }

        let mut state = lock(&self.shared.state);
        if !self.shared.gate.is_live(generation) {
            log::debug!("CollectionSync: stopped during start on {}", query.collection);
            return Ok(());
        }
        let weak = Arc::downgrade(&self.shared);
        state.listener = Some(self.shared.config.dispatch.spawn(listen(weak, generation, rx)));
        log::info!(
            "CollectionSync: listening on {} ({} event observers)",
            query.collection,
            self.shared.event_observers.len()
        );
        Ok(())
    }

    /// Cancel the subscription and clear the cache.
    ///
    /// No observer runs after this returns. Safe to call from an observer.
    pub fn stop(&self) {
        self.shared.gate.advance();
        let mut state = lock(&self.shared.state);
        if let Some(listener) = state.listener.take() {
            listener.abort();
            if let Some(collection) = &state.collection {
                log::info!("CollectionSync: stopped listening on {collection}");
            }
        }
        state.cache.clear();
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.shared.state)
            .listener
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Merge-write `item` at its identity.
    pub async fn insert(&self, item: &T) -> Result<(), SyncError> {
        let id = item.id().ok_or(SyncError::MissingIdentity)?;
        let doc = self.target()?.doc(id);
        let fields = encode_fields(item)?;
        self.shared.store.write_document(&doc, fields, true).await?;
        Ok(())
    }

    /// Delete the document `id`.
    pub async fn remove_by_id(&self, id: &str) -> Result<(), SyncError> {
        let doc = self.target()?.doc(id);
        self.shared.store.delete_document(&doc).await?;
        Ok(())
    }

    /// Delete the document behind cache position `index`.
    pub async fn remove_at(&self, index: usize) -> Result<(), SyncError> {
        let id = self.id_at(index)?;
        self.remove_by_id(&id).await
    }

    /// Delete the documents behind several cache positions concurrently.
    ///
    /// Positions are resolved against the cache as it is now. Individual
    /// failures are logged and dropped; this always succeeds.
    pub async fn remove_many(&self, indices: &[usize]) -> Result<(), SyncError> {
        let ids: Vec<String> = indices
            .iter()
            .filter_map(|&index| match self.id_at(index) {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("CollectionSync: skipping removal at {index}: {e}");
                    None
                }
            })
            .collect();

        let results = join_all(ids.iter().map(|id| self.remove_by_id(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("CollectionSync: failed to remove {id}: {e}");
            }
        }
        Ok(())
    }

    pub async fn commit_all(&self) -> Result<(), SyncError> {
        let strategy = Arc::clone(&self.shared.strategy);
        strategy.commit_all(self).await
    }

    pub async fn commit_at(&self, index: usize) -> Result<(), SyncError> {
        let strategy = Arc::clone(&self.shared.strategy);
        strategy.commit_at(self, index).await
    }

    pub async fn commit(&self, item: &T) -> Result<(), SyncError> {
        let strategy = Arc::clone(&self.shared.strategy);
        strategy.commit(self, item).await
    }

    /// Called with the effective kind of every applied change.
    pub fn on_event<F>(&self, observer: F)
    where
        F: FnMut(ChangeKind, &T) + Send + 'static,
    {
        self.shared.event_observers.push(Box::new(observer));
    }

    /// Called once per push with the items decoded from it, in arrival order.
    pub fn on_batch<F>(&self, observer: F)
    where
        F: FnMut(&[T]) + Send + 'static,
    {
        self.shared.batch_observers.push(Box::new(observer));
    }

    pub fn clear_observers(&self) {
        self.shared.event_observers.clear();
        self.shared.batch_observers.clear();
    }

    /// Copy of the cache contents, in order.
    pub fn items(&self) -> Vec<T> {
        lock(&self.shared.state).cache.items().to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).cache.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.shared.state).cache.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        lock(&self.shared.state).cache.get(index).cloned()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        lock(&self.shared.state).cache.position(id)
    }

    pub fn collection(&self) -> Option<CollectionRef> {
        lock(&self.shared.state).collection.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.stats.snapshot()
    }

    fn target(&self) -> Result<CollectionRef, SyncError> {
        lock(&self.shared.state)
            .collection
            .clone()
            .ok_or(SyncError::NotBound)
    }

    fn id_at(&self, index: usize) -> Result<String, SyncError> {
        let state = lock(&self.shared.state);
        let item = state.cache.get(index).ok_or(SyncError::IndexOutOfRange {
            index,
            len: state.cache.len(),
        })?;
        item.id().map(str::to_owned).ok_or(SyncError::MissingIdentity)
    }
}

impl<T: SyncItem> Shared<T> {
    /// Apply one push. Returns `false` once `generation` is no longer live.
    fn process(&self, generation: u64, push: CollectionPush) -> bool {
        let batch = match push {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("CollectionSync: listener error: {e}");
                return self.gate.is_live(generation);
            }
        };
        self.gate
            .run(generation, || self.apply_batch(generation, batch))
            .unwrap_or(false)
    }

    fn apply_batch(&self, generation: u64, batch: ChangeBatch) -> bool {
        if self.config.log_batches {
            log::debug!("CollectionSync: applying batch of {} changes", batch.len());
        }

        let mut decoded = Vec::with_capacity(batch.len());
        for change in batch {
            let item: T = match decode_item(&change.document) {
                Ok(item) => item,
                Err(e) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("CollectionSync: dropping {:?} change: {e}", change.kind);
                    continue;
                }
            };

            let applied = lock(&self.state).cache.apply(change.kind, item.clone());
            if let Some(kind) = applied {
                self.stats.events_applied.fetch_add(1, Ordering::Relaxed);
                self.notify_event(generation, kind, &item);
            }
            decoded.push(item);

            if !self.gate.is_live(generation) {
                return false;
            }
        }

        self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        let (epoch, mut observers) = self.batch_observers.take();
        for observer in observers.iter_mut() {
            observer(&decoded);
            if !self.gate.is_live(generation) {
                break;
            }
        }
        self.batch_observers.restore(epoch, observers);
        self.gate.is_live(generation)
    }

    fn notify_event(&self, generation: u64, kind: ChangeKind, item: &T) {
        let (epoch, mut observers) = self.event_observers.take();
        for observer in observers.iter_mut() {
            if !self.gate.is_live(generation) {
                break;
            }
            observer(kind, item);
        }
        self.event_observers.restore(epoch, observers);
    }
}

async fn listen<T: SyncItem>(
    shared: Weak<Shared<T>>,
    generation: u64,
    mut rx: CollectionSubscription,
) {
    while let Some(push) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.process(generation, push) {
            break;
        }
    }
    log::debug!("CollectionSync: listener for generation {generation} exited");
}
