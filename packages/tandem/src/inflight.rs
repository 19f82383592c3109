//! Inflight work tracking.
//!
//! Counts actions that have entered the bridge but have not yet reached their
//! destination:
//!
//! - a `put` is inflight until the drain loop has dispatched it to the host
//! - an intercepted host action is inflight until it has been offered to the
//!   action channel and the new state has been published
//! - a queued action is inflight until the pump has broadcast it
//!
//! `Bridge::settle` waits for the count to reach zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::warn;

/// Counter of inflight actions with a wait-for-zero primitive.
#[derive(Default)]
pub struct Inflight {
    count: AtomicUsize,
    notify: Notify,
}

impl Inflight {
    /// Create an idle tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the inflight count.
    pub fn inc(&self, n: usize) {
        if n > 0 {
            self.count.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Decrement the inflight count, waking waiters when it reaches zero.
    pub fn dec(&self, n: usize) {
        if n == 0 {
            return;
        }
        let result = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(n))
            });
        // fetch_update with an infallible closure always returns Ok
        let prev = result.unwrap_or_else(|prev| prev);
        if prev < n {
            warn!(prev, n, "inflight count decremented below zero");
        }
        if prev <= n {
            self.notify.notify_waiters();
        }
    }

    /// Track `n` actions until the returned guard drops.
    pub fn guard(self: &Arc<Self>, n: usize) -> InflightGuard {
        self.inc(n);
        InflightGuard {
            tracker: self.clone(),
            n,
        }
    }

    /// Current inflight count.
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether nothing is inflight.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until the count reaches zero.
    ///
    /// Returns immediately if nothing is inflight.
    pub async fn wait_idle(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.notify.notified();

            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }

            // Notify is edge-triggered: recheck after waking
            notified.await;
        }
    }
}

impl std::fmt::Debug for Inflight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflight")
            .field("pending", &self.pending())
            .finish()
    }
}

/// RAII guard that keeps actions inflight until dropped.
///
/// Dropping on every exit path (including panics and cancellation) keeps the
/// count from leaking.
pub struct InflightGuard {
    tracker: Arc<Inflight>,
    n: usize,
}

impl InflightGuard {
    /// Take over `n` actions that were already counted with [`Inflight::inc`].
    pub fn adopt(tracker: Arc<Inflight>, n: usize) -> Self {
        Self { tracker, n }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.dec(self.n);
    }
}
