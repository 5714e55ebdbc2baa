//! Serialized dispatch of remote pushes.
//!
//! Each synchronizer and mirror owns one [`DispatchGate`]. A push is applied
//! (cache mutation plus observer calls) inside `run()`, one at a time. The
//! gate carries a generation number: `advance()` invalidates every listener
//! started under an older generation.
//!
//! `advance()` from another context waits for the in-flight dispatch, so no
//! observer of the old generation runs after it returns. From inside an
//! observer (same thread, same gate) it only bumps the generation; the
//! running dispatch sees that before its next event and stops.
//!
//! Listener tasks are spawned on the [`Dispatch`] target chosen at
//! construction.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Where listener tasks run.
#[derive(Debug, Clone, Default)]
pub enum Dispatch {
    /// The runtime the caller of `start()` is running on.
    #[default]
    Current,
    /// An explicit runtime, e.g. a dedicated single-threaded one.
    Runtime(Handle),
}

impl Dispatch {
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            Dispatch::Current => tokio::spawn(future),
            Dispatch::Runtime(handle) => handle.spawn(future),
        }
    }
}

/// Lock a mutex, recovering the data if an observer panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct DispatchGate {
    serial: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
    generation: AtomicU64,
}

impl DispatchGate {
    pub(crate) fn new() -> Self {
        Self {
            serial: Mutex::new(()),
            owner: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn is_live(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Run `f` as the dispatch for `generation`. `None` when that generation
    /// has been invalidated.
    pub(crate) fn run<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let _serial = lock(&self.serial);
        if !self.is_live(generation) {
            return None;
        }
        let _owner = OwnerGuard::enter(&self.owner);
        Some(f())
    }

    /// Invalidate the current generation and return the new one.
    pub(crate) fn advance(&self) -> u64 {
        if self.in_dispatch() {
            return self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        }
        let _serial = lock(&self.serial);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn in_dispatch(&self) -> bool {
        *lock(&self.owner) == Some(thread::current().id())
    }
}

/// Marks the current thread as the dispatching one until dropped.
struct OwnerGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
}

impl<'a> OwnerGuard<'a> {
    fn enter(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(owner) = Some(thread::current().id());
        Self { owner }
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *lock(self.owner) = None;
    }
}

/// Registered observers of one kind.
///
/// Observers are taken out for the duration of a dispatch so they may
/// register further observers (or clear the set) without deadlocking.
pub(crate) struct ObserverSet<F: ?Sized> {
    inner: Mutex<ObserverList<F>>,
}

struct ObserverList<F: ?Sized> {
    epoch: u64,
    list: Vec<Box<F>>,
}

impl<F: ?Sized> ObserverSet<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ObserverList {
                epoch: 0,
                list: Vec::new(),
            }),
        }
    }

    pub(crate) fn push(&self, observer: Box<F>) {
        lock(&self.inner).list.push(observer);
    }

    pub(crate) fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.epoch += 1;
        inner.list.clear();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).list.len()
    }

    pub(crate) fn take(&self) -> (u64, Vec<Box<F>>) {
        let mut inner = lock(&self.inner);
        (inner.epoch, std::mem::take(&mut inner.list))
    }

    /// Put observers taken by [`take`](Self::take) back in front of any
    /// registered meanwhile. Dropped if the set was cleared in between.
    pub(crate) fn restore(&self, epoch: u64, mut taken: Vec<Box<F>>) {
        let mut inner = lock(&self.inner);
        if inner.epoch != epoch {
            return;
        }
        taken.append(&mut inner.list);
        inner.list = taken;
    }
}
