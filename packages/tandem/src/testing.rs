//! Testing utilities for bridges and processes.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tandem = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use tandem::testing::{eventually, init_tracing, recording_reducer, shared_latch};
//!
//! init_tracing();
//!
//! let latch = shared_latch(3);
//! let bridge = Bridge::new(root)?;
//! let store = Store::builder(recording_reducer)
//!     .middleware(bridge.middleware())
//!     .build()?;
//!
//! store.dispatch(Action::new("FIRE"))?;
//! latch.await_zero().await;
//!
//! eventually(Duration::from_secs(1), || store.get_state().types().len() == 4).await?;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::Action;
use crate::error::TandemError;

// =============================================================================
// Latch
// =============================================================================

/// Waits for a known number of occurrences.
///
/// Tests wait for meaning, not time: a process calls [`dec`](Self::dec) each
/// time the awaited thing happens and the test awaits
/// [`await_zero`](Self::await_zero).
///
/// ```ignore
/// let latch = shared_latch(5);
/// ctx.take_every(of_type("ACTION"), latch.clone(), |_, latch| async move {
///     latch.dec();
///     Ok(())
/// });
///
/// tokio::time::timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug)]
pub struct Latch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Latch {
    /// A latch expecting `expected` occurrences.
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Record one occurrence.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Err(_) => panic!("Latch decremented below zero - more occurrences than expected"),
            Ok(1) => self.notify.notify_waiters(),
            Ok(_) => {}
        }
    }

    /// Wait for the count to reach zero. Returns immediately if it already has.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking, or a concurrent dec could be missed.
            let notified = self.notify.notified();

            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Occurrences still expected.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Whether the count has reached zero.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// A [`Latch`] shared across processes and closures.
pub type SharedLatch = Arc<Latch>;

/// Convenience for `Arc::new(Latch::new(expected))`.
pub fn shared_latch(expected: usize) -> SharedLatch {
    Arc::new(Latch::new(expected))
}

// =============================================================================
// Recording host
// =============================================================================

/// Host state that records every action the reducer saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recorded {
    pub actions: Vec<Action>,
}

impl Recorded {
    /// Types of the recorded actions, in reducer order.
    pub fn types(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.kind().to_string()).collect()
    }

    /// How many recorded actions have type `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.actions.iter().filter(|a| a.is(kind)).count()
    }
}

/// A reducer that appends every action to [`Recorded`].
pub fn recording_reducer(state: &Recorded, action: &Action) -> anyhow::Result<Recorded> {
    let mut next = state.clone();
    next.actions.push(action.clone());
    Ok(next)
}

// =============================================================================
// Polling and tracing
// =============================================================================

/// Poll `condition` every 5ms until it holds.
///
/// # Errors
///
/// [`TandemError::Timeout`] if it still does not hold after `timeout`.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> Result<(), TandemError>
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| TandemError::Timeout { duration: timeout })
}

/// Install a test-friendly tracing subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
