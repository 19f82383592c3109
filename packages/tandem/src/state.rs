//! The state cell: latest host state snapshot plus a stream of changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};

use crate::broadcast::{Broadcast, Subscription};

/// Bound for host state snapshots.
///
/// Before the first publish the cell holds `S::default()`.
pub trait State: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> State for T {}

/// Synchronized holder of the latest host state snapshot.
///
/// Updates are serialized: the producer passed to [`update`](Self::update)
/// runs under the cell's lock, and the new snapshot is broadcast before the
/// lock is released, so `changes()` observes snapshots in update order.
pub struct StateCell<S> {
    current: Arc<Mutex<S>>,
    changes: Broadcast<S>,
}

impl<S> Clone for StateCell<S> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<S: State> StateCell<S> {
    /// Create a cell holding `S::default()`. Late `changes()` subscribers get
    /// the last `replay` snapshots.
    pub fn new(replay: usize) -> Self {
        Self {
            current: Arc::new(Mutex::new(S::default())),
            changes: Broadcast::new(replay),
        }
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current snapshot.
    pub fn read(&self) -> S {
        self.lock().clone()
    }

    /// Apply `f` to the current snapshot without cloning it.
    pub fn read_with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock())
    }

    /// Replace the snapshot with `f(current)` and publish it.
    pub fn update(&self, f: impl FnOnce(&S) -> S) -> S {
        let mut current = self.lock();
        let next = f(&current);
        *current = next.clone();
        self.changes.publish(next.clone());
        next
    }

    /// Replace the snapshot and publish it.
    pub fn set(&self, snapshot: S) {
        self.update(move |_| snapshot);
    }

    /// Every snapshot passed to `update` from now on, after the replay window.
    pub fn changes(&self) -> Subscription<S> {
        self.changes.subscribe()
    }

    /// A stream that yields the current snapshot once.
    pub fn latest(&self) -> BoxStream<'static, S> {
        stream::once(futures::future::ready(self.read())).boxed()
    }
}

impl<S> StateCell<S> {
    /// End every `changes()` subscription.
    pub fn close(&self) {
        self.changes.close();
    }
}

impl<S> std::fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell").finish_non_exhaustive()
    }
}
