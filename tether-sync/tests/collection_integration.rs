//! End-to-end tests for `CollectionSync` against the in-memory store.
//!
//! Pushes are observed through an `on_batch` channel so each test can wait
//! for the listener task without sleeping.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tether_sync::{
    ChangeBatch, ChangeKind, CollectionRef, CollectionSync, DocumentChange, DocumentSnapshot,
    Dispatch, FilterOp, Identifiable, MemoryStore, MergeWriteThrough, Query, StoreError,
    SyncConfig, SyncError, WriteRecord,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Ordered by rank only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Goal {
    title: String,
    rank: i64,
    #[serde(skip)]
    id: Option<String>,
}

impl Goal {
    fn new(id: &str, title: &str, rank: i64) -> Self {
        Self {
            title: title.to_string(),
            rank,
            id: Some(id.to_string()),
        }
    }
}

impl Identifiable for Goal {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

impl PartialEq for Goal {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl Eq for Goal {}

impl PartialOrd for Goal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Goal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

fn goals() -> CollectionRef {
    CollectionRef::new("goals")
}

fn snapshot(id: &str, rank: i64) -> DocumentSnapshot {
    let value = json!({"title": id, "rank": rank});
    let fields = value.as_object().cloned().unwrap();
    DocumentSnapshot::new(id, fields)
}

fn ids(sync: &CollectionSync<Goal>) -> Vec<String> {
    sync.items().into_iter().filter_map(|g| g.id).collect()
}

/// A started synchronizer plus a channel receiving the size of every batch
/// applied after start.
async fn started(store: &Arc<MemoryStore>) -> (CollectionSync<Goal>, mpsc::UnboundedReceiver<usize>) {
    let sync = CollectionSync::with_source(store.clone(), goals(), None, SyncConfig::for_testing());
    sync.start().await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    sync.on_batch(move |items: &[Goal]| {
        let _ = tx.send(items.len());
    });
    (sync, rx)
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timed out waiting for batch")
        .expect("Observer dropped")
}

#[tokio::test]
async fn test_insert_round_trips_through_store() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    sync.insert(&Goal::new("b", "write", 2)).await.unwrap();
    next_batch(&mut batches).await;
    sync.insert(&Goal::new("a", "read", 1)).await.unwrap();
    next_batch(&mut batches).await;

    assert_eq!(ids(&sync), vec!["a", "b"]);
    let doc = store.document(&goals().doc("a")).unwrap();
    assert_eq!(doc.get("title"), Some(&json!("read")));
    assert!(!doc.contains_key("id"));
}

#[tokio::test]
async fn test_order_invariant_under_interleaved_events() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    let ranks = [7, 3, 9, 3, 1, 5, 8, 2];
    for (n, rank) in ranks.iter().enumerate() {
        sync.insert(&Goal::new(&format!("g{n}"), "x", *rank)).await.unwrap();
        next_batch(&mut batches).await;
    }
    // re-rank a few, delete one
    sync.insert(&Goal::new("g0", "x", 0)).await.unwrap();
    next_batch(&mut batches).await;
    sync.insert(&Goal::new("g4", "x", 10)).await.unwrap();
    next_batch(&mut batches).await;
    sync.remove_by_id("g2").await.unwrap();
    next_batch(&mut batches).await;

    let items = sync.items();
    assert_eq!(items.len(), ranks.len() - 1);
    assert!(items.windows(2).all(|w| w[0] <= w[1]));
    let mut unique = ids(&sync);
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), items.len());
    assert_eq!(items.first().and_then(|g| g.id()), Some("g0"));
    assert_eq!(items.last().and_then(|g| g.id()), Some("g4"));
}

#[tokio::test]
async fn test_modify_reinserts_at_new_position() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![
            DocumentChange::added(snapshot("A", 1)),
            DocumentChange::added(snapshot("B", 2)),
        ])),
    );
    next_batch(&mut batches).await;
    assert_eq!(ids(&sync), vec!["A", "B"]);

    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![DocumentChange::modified(snapshot("A", 3))])),
    );
    next_batch(&mut batches).await;
    assert_eq!(ids(&sync), vec!["B", "A"]);
    assert_eq!(sync.get(1).map(|g| g.rank), Some(3));
}

#[tokio::test]
async fn test_removal_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![
            DocumentChange::added(snapshot("A", 1)),
            DocumentChange::added(snapshot("B", 2)),
        ])),
    );
    next_batch(&mut batches).await;

    let remove_a = || Ok(ChangeBatch::new(vec![DocumentChange::removed(snapshot("A", 1))]));
    store.emit(&goals(), remove_a());
    next_batch(&mut batches).await;
    let once = ids(&sync);
    store.emit(&goals(), remove_a());
    next_batch(&mut batches).await;

    assert_eq!(ids(&sync), once);
    assert_eq!(once, vec!["B"]);
}

#[tokio::test]
async fn test_batch_with_decode_failure_is_partially_applied() {
    let store = Arc::new(MemoryStore::new());
    let (sync, _) = started(&store).await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let (tx, mut done) = mpsc::unbounded_channel();
    sync.on_batch(move |items: &[Goal]| {
        sink.lock()
            .unwrap()
            .extend(items.iter().filter_map(|g| g.id.clone()));
        let _ = tx.send(());
    });

    let broken = json!({"title": "broken", "rank": "high"});
    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![
            DocumentChange::added(snapshot("one", 1)),
            DocumentChange::added(DocumentSnapshot::new(
                "two",
                broken.as_object().cloned().unwrap(),
            )),
            DocumentChange::added(snapshot("three", 3)),
        ])),
    );
    timeout(Duration::from_secs(2), done.recv()).await.unwrap();

    assert_eq!(*observed.lock().unwrap(), vec!["one", "three"]);
    assert_eq!(ids(&sync), vec!["one", "three"]);
    let stats = sync.stats();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.events_applied, 2);
}

#[tokio::test]
async fn test_event_observer_sees_effective_kinds() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    sync.on_event(move |kind, goal: &Goal| {
        sink.lock().unwrap().push((kind, goal.id.clone().unwrap_or_default()));
    });

    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![
            DocumentChange::added(snapshot("A", 1)),
            DocumentChange::added(snapshot("A", 2)),
            DocumentChange::modified(snapshot("B", 1)),
            DocumentChange::removed(snapshot("C", 1)),
            DocumentChange::removed(snapshot("A", 2)),
        ])),
    );
    next_batch(&mut batches).await;

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            (ChangeKind::Added, "A".to_string()),
            (ChangeKind::Modified, "A".to_string()),
            (ChangeKind::Added, "B".to_string()),
            (ChangeKind::Removed, "A".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_remove_at_maps_index_to_identity() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;
    for (id, rank) in [("x", 1), ("y", 2), ("z", 3)] {
        sync.insert(&Goal::new(id, id, rank)).await.unwrap();
        next_batch(&mut batches).await;
    }

    assert_eq!(
        sync.remove_at(5).await,
        Err(SyncError::IndexOutOfRange { index: 5, len: 3 })
    );

    sync.remove_at(1).await.unwrap();
    let last = store.write_log().pop().unwrap();
    assert_eq!(last, WriteRecord::Delete { doc: goals().doc("y") });
    next_batch(&mut batches).await;
    assert_eq!(ids(&sync), vec!["x", "z"]);
}

#[tokio::test]
async fn test_remove_many_swallows_individual_failures() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;
    for (id, rank) in [("p", 1), ("q", 2), ("r", 3)] {
        sync.insert(&Goal::new(id, id, rank)).await.unwrap();
        next_batch(&mut batches).await;
    }

    store.fail_next(StoreError::PermissionDenied("locked".into()));
    sync.remove_many(&[0, 2, 9]).await.unwrap();

    let deletes = store
        .write_log()
        .into_iter()
        .filter(|r| matches!(r, WriteRecord::Delete { .. }))
        .count();
    assert_eq!(deletes, 1);
    assert_eq!(store.documents(&goals()).len(), 2);
}

#[tokio::test]
async fn test_filtered_query_tracks_membership() {
    let store = Arc::new(MemoryStore::new());
    let query = Query::collection(goals()).filter("rank", FilterOp::Lt, 5);
    let sync: CollectionSync<Goal> =
        CollectionSync::with_source(store.clone(), goals(), Some(query), SyncConfig::default());
    sync.start().await.unwrap();
    let (tx, mut batches) = mpsc::unbounded_channel();
    sync.on_batch(move |items: &[Goal]| {
        let _ = tx.send(items.len());
    });

    sync.insert(&Goal::new("low", "low", 1)).await.unwrap();
    next_batch(&mut batches).await;
    sync.insert(&Goal::new("high", "high", 8)).await.unwrap();
    sync.insert(&Goal::new("low", "low", 6)).await.unwrap();
    next_batch(&mut batches).await;

    assert!(sync.is_empty());
    assert_eq!(store.documents(&goals()).len(), 2);
}

#[tokio::test]
async fn test_stop_from_observer_halts_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let (sync, _) = started(&store).await;

    let seen = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let handle = sync.clone();
    sync.on_event(move |_, _: &Goal| {
        *counter.lock().unwrap() += 1;
        handle.stop();
    });
    let batches = Arc::new(Mutex::new(0usize));
    let batch_counter = Arc::clone(&batches);
    sync.on_batch(move |_: &[Goal]| *batch_counter.lock().unwrap() += 1);

    store.emit(
        &goals(),
        Ok(ChangeBatch::new(vec![
            DocumentChange::added(snapshot("A", 1)),
            DocumentChange::added(snapshot("B", 2)),
        ])),
    );
    store.emit(&goals(), Ok(ChangeBatch::new(vec![DocumentChange::added(snapshot("C", 3))])));

    timeout(Duration::from_secs(2), async {
        while sync.is_listening() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(*batches.lock().unwrap(), 0);
    assert!(sync.is_empty());
}

#[tokio::test]
async fn test_no_observer_after_stop() {
    let store = Arc::new(MemoryStore::new());
    let (sync, _) = started(&store).await;
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    sync.on_event(move |_, _: &Goal| *counter.lock().unwrap() += 1);

    sync.stop();
    store.emit(&goals(), Ok(ChangeBatch::new(vec![DocumentChange::added(snapshot("A", 1))])));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(sync.is_empty());
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn test_restart_rebuilds_cache() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;
    sync.insert(&Goal::new("a", "a", 1)).await.unwrap();
    next_batch(&mut batches).await;

    sync.stop();
    assert!(sync.is_empty());
    sync.start().await.unwrap();
    assert_eq!(ids(&sync), vec!["a"]);
}

#[tokio::test]
async fn test_listener_error_keeps_listening() {
    let store = Arc::new(MemoryStore::new());
    let (sync, mut batches) = started(&store).await;

    store.emit(&goals(), Err(StoreError::Unavailable("flaky".into())));
    sync.insert(&Goal::new("a", "a", 1)).await.unwrap();
    assert_eq!(next_batch(&mut batches).await, 1);
    assert!(sync.is_listening());
}

#[tokio::test]
async fn test_merge_write_through_commits_cache() {
    let store = Arc::new(MemoryStore::new());
    let sync: CollectionSync<Goal> = CollectionSync::with_strategy(
        store.clone(),
        SyncConfig::default(),
        Arc::new(MergeWriteThrough),
    );
    sync.attach(goals(), None);
    sync.insert(&Goal::new("m", "m", 1)).await.unwrap();
    sync.start().await.unwrap();

    let before = store.write_log().len();
    sync.commit_all().await.unwrap();
    sync.commit_at(0).await.unwrap();
    assert_eq!(store.write_log().len(), before + 2);
}

#[test]
fn test_explicit_runtime_dispatch() {
    let listeners = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let caller = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        dispatch: Dispatch::Runtime(listeners.handle().clone()),
        log_batches: false,
    };
    let sync: CollectionSync<Goal> = CollectionSync::with_source(store, goals(), None, config);

    caller.block_on(async {
        sync.start().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sync.on_batch(move |items: &[Goal]| {
            let _ = tx.send(items.len());
        });
        sync.insert(&Goal::new("rt", "rt", 1)).await.unwrap();
        assert_eq!(next_batch(&mut rx).await, 1);
        sync.stop();
    });
}
