//! Single-document mirror.
//!
//! Holds the latest decoded value of one remote document and reports every
//! push to its observers as `Result<T, SyncError>`. A failed push (transport
//! error, missing document, bad shape) leaves the held value untouched.

use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

use crate::collection::SyncConfig;
use crate::dispatch::{lock, DispatchGate, ObserverSet};
use crate::error::SyncError;
use crate::item::{decode_record, encode_fields, Record};
use crate::protocol::DocumentRef;
use crate::store::{DocumentPush, DocumentSubscription, RemoteStore};

/// Outcome of the last push.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MirrorStatus {
    /// Nothing received yet
    #[default]
    Idle,
    /// Last push decoded
    Synced,
    /// Last push failed
    Failed(SyncError),
}

/// Value plus status, read together.
#[derive(Debug, Clone)]
pub struct MirrorState<T> {
    pub value: Option<T>,
    pub status: MirrorStatus,
}

impl<T> Default for MirrorState<T> {
    fn default() -> Self {
        Self {
            value: None,
            status: MirrorStatus::Idle,
        }
    }
}

type ChangeObserver<T> = dyn FnMut(&Result<T, SyncError>) + Send;

struct Shared<T: Record> {
    store: Arc<dyn RemoteStore>,
    doc: DocumentRef,
    config: SyncConfig,
    gate: DispatchGate,
    state: Mutex<MirrorState<T>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    observers: ObserverSet<ChangeObserver<T>>,
}

/// Live local copy of one remote document.
///
/// Cloning yields another handle to the same mirror.
pub struct DocumentMirror<T: Record> {
    shared: Arc<Shared<T>>,
}

impl<T: Record> Clone for DocumentMirror<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Record> DocumentMirror<T> {
    pub fn new(store: Arc<dyn RemoteStore>, doc: DocumentRef, config: SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                doc,
                config,
                gate: DispatchGate::new(),
                state: Mutex::new(MirrorState::default()),
                listener: Mutex::new(None),
                observers: ObserverSet::new(),
            }),
        }
    }

    /// Called with the outcome of every push.
    pub fn on_change<F>(&self, observer: F)
    where
        F: FnMut(&Result<T, SyncError>) + Send + 'static,
    {
        self.shared.observers.push(Box::new(observer));
    }

    pub fn clear_observers(&self) {
        self.shared.observers.clear();
    }

    /// Subscribe to the document. Resolves once the first push has been
    /// applied; restarts the listener if one is running.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.stop();
        let generation = self.shared.gate.current();
        let mut rx = self.shared.store.subscribe_document(&self.shared.doc).await?;

        if let Some(push) = rx.recv().await {
            self.shared.process(generation, push);
        }

        let mut listener = lock(&self.shared.listener);
        if !self.shared.gate.is_live(generation) {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.shared);
        *listener = Some(self.shared.config.dispatch.spawn(listen(weak, generation, rx)));
        log::info!("DocumentMirror: listening on {}", self.shared.doc);
        Ok(())
    }

    /// Cancel the subscription. The held value is kept.
    pub fn stop(&self) {
        self.shared.gate.advance();
        if let Some(listener) = lock(&self.shared.listener).take() {
            listener.abort();
            log::info!("DocumentMirror: stopped listening on {}", self.shared.doc);
        }
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.shared.listener)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Merge-write the held value.
    pub async fn commit(&self) -> Result<(), SyncError> {
        let value = self.value().ok_or(SyncError::NothingToCommit)?;
        let fields = encode_fields(&value)?;
        self.shared
            .store
            .write_document(&self.shared.doc, fields, true)
            .await?;
        log::debug!("DocumentMirror: committed {}", self.shared.doc);
        Ok(())
    }

    pub fn value(&self) -> Option<T> {
        lock(&self.shared.state).value.clone()
    }

    pub fn set_value(&self, value: T) {
        lock(&self.shared.state).value = Some(value);
    }

    /// Edit a copy of the held value and store it back. Returns `false` when
    /// there is none. `f` runs without the mirror locked.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) -> bool {
        let Some(mut value) = self.value() else {
            return false;
        };
        f(&mut value);
        lock(&self.shared.state).value = Some(value);
        true
    }

    pub fn clear(&self) {
        *lock(&self.shared.state) = MirrorState::default();
    }

    pub fn status(&self) -> MirrorStatus {
        lock(&self.shared.state).status.clone()
    }

    pub fn state(&self) -> MirrorState<T> {
        lock(&self.shared.state).clone()
    }

    pub fn doc_ref(&self) -> &DocumentRef {
        &self.shared.doc
    }
}

impl<T: Record> Shared<T> {
    fn process(&self, generation: u64, push: DocumentPush) -> bool {
        let result = match push {
            Err(e) => Err(SyncError::Store(e)),
            Ok(None) => Err(SyncError::Decode(format!("{}: no such document", self.doc))),
            Ok(Some(snapshot)) => decode_record::<T>(&snapshot),
        };

        self.gate
            .run(generation, || {
                {
                    let mut state = lock(&self.state);
                    match &result {
                        Ok(value) => {
                            state.value = Some(value.clone());
                            state.status = MirrorStatus::Synced;
                        }
                        Err(e) => {
                            log::warn!("DocumentMirror: {}: {e}", self.doc);
                            state.status = MirrorStatus::Failed(e.clone());
                        }
                    }
                }

                let (epoch, mut observers) = self.observers.take();
                for observer in observers.iter_mut() {
                    if !self.gate.is_live(generation) {
                        break;
                    }
                    observer(&result);
                }
                self.observers.restore(epoch, observers);
                self.gate.is_live(generation)
            })
            .unwrap_or(false)
    }
}

async fn listen<T: Record>(shared: Weak<Shared<T>>, generation: u64, mut rx: DocumentSubscription) {
    while let Some(push) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.process(generation, push) {
            break;
        }
    }
    log::debug!("DocumentMirror: listener for generation {generation} exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::protocol::CollectionRef;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        volume: u8,
    }

    fn settings_doc() -> DocumentRef {
        CollectionRef::new("settings").doc("u1")
    }

    #[tokio::test]
    async fn test_commit_empty_mirror() {
        let mirror: DocumentMirror<Settings> = DocumentMirror::new(
            Arc::new(MemoryStore::new()),
            settings_doc(),
            SyncConfig::default(),
        );
        assert_eq!(mirror.commit().await, Err(SyncError::NothingToCommit));
    }

    #[tokio::test]
    async fn test_missing_document_reports_decode_error() {
        let mirror: DocumentMirror<Settings> = DocumentMirror::new(
            Arc::new(MemoryStore::new()),
            settings_doc(),
            SyncConfig::for_testing(),
        );
        mirror.start().await.unwrap();
        assert!(matches!(mirror.status(), MirrorStatus::Failed(SyncError::Decode(_))));
        assert_eq!(mirror.value(), None);
        mirror.stop();
    }

    #[tokio::test]
    async fn test_commit_then_start_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let writer = DocumentMirror::new(store.clone(), settings_doc(), SyncConfig::default());
        writer.set_value(Settings {
            theme: "dark".into(),
            volume: 3,
        });
        writer.commit().await.unwrap();

        let reader: DocumentMirror<Settings> =
            DocumentMirror::new(store, settings_doc(), SyncConfig::default());
        reader.start().await.unwrap();
        assert_eq!(reader.status(), MirrorStatus::Synced);
        assert_eq!(reader.value().map(|s| s.volume), Some(3));

        reader.stop();
        assert!(!reader.is_listening());
        assert!(reader.value().is_some());
    }

    #[test]
    fn test_update_and_clear() {
        let mirror: DocumentMirror<Settings> = DocumentMirror::new(
            Arc::new(MemoryStore::new()),
            settings_doc(),
            SyncConfig::default(),
        );
        assert!(!mirror.update(|s| s.volume = 1));
        mirror.set_value(Settings {
            theme: "light".into(),
            volume: 0,
        });
        assert!(mirror.update(|s| s.volume = 9));
        assert_eq!(mirror.value().map(|s| s.volume), Some(9));

        mirror.clear();
        let state = mirror.state();
        assert!(state.value.is_none());
        assert_eq!(state.status, MirrorStatus::Idle);
    }

    #[test]
    fn test_update_closure_may_read_mirror() {
        let mirror: DocumentMirror<Settings> = DocumentMirror::new(
            Arc::new(MemoryStore::new()),
            settings_doc(),
            SyncConfig::default(),
        );
        mirror.set_value(Settings {
            theme: "light".into(),
            volume: 2,
        });

        let reader = mirror.clone();
        assert!(mirror.update(|s| {
            let before = reader.value().map(|v| v.volume).unwrap_or_default();
            s.volume = before * 2;
            assert_eq!(reader.status(), MirrorStatus::Idle);
        }));
        assert_eq!(mirror.value().map(|s| s.volume), Some(4));
    }
}
