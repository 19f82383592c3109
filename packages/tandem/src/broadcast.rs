//! Replaying broadcast hub.
//!
//! # Guarantees
//!
//! - **Lossless**: every subscriber receives every item published after it
//!   subscribed. Each subscriber has its own unbounded buffer, so a slow
//!   subscriber never starves or lags a fast one.
//! - **Replay**: a new subscriber first receives the last `replay` published
//!   items, then everything published afterwards, with no gap or duplicate.
//! - **Ordered**: all subscribers observe items in publish order.
//!
//! Publishing and subscribing happen under the same lock, which is what makes
//! the replay handoff gap-free.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::queue::TakeSource;

struct Hub<T> {
    window: VecDeque<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// A broadcast hub with a replay window.
pub struct Broadcast<T> {
    hub: Arc<Mutex<Hub<T>>>,
    replay: usize,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            replay: self.replay,
        }
    }
}

impl<T> Broadcast<T> {
    /// Create a hub that replays the last `replay` items to late subscribers.
    pub fn new(replay: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                window: VecDeque::with_capacity(replay),
                subscribers: Vec::new(),
                closed: false,
            })),
            replay,
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub<T>> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop publishing. Existing subscriptions end after draining what they
    /// already received.
    pub fn close(&self) {
        let mut hub = self.hub();
        hub.closed = true;
        hub.subscribers.clear();
    }

    /// Whether the hub has been closed.
    pub fn is_closed(&self) -> bool {
        self.hub().closed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut hub = self.hub();
        hub.subscribers.retain(|tx| !tx.is_closed());
        hub.subscribers.len()
    }

    /// Size of the replay window.
    pub fn replay(&self) -> usize {
        self.replay
    }
}

impl<T: Clone> Broadcast<T> {
    /// Publish an item to every current subscriber.
    ///
    /// Returns the number of subscribers that received it. Publishing to a
    /// closed hub is a no-op.
    pub fn publish(&self, item: T) -> usize {
        let mut hub = self.hub();
        if hub.closed {
            return 0;
        }

        hub.subscribers.retain(|tx| tx.send(item.clone()).is_ok());

        if self.replay > 0 {
            if hub.window.len() == self.replay {
                hub.window.pop_front();
            }
            hub.window.push_back(item);
        }

        hub.subscribers.len()
    }

    /// Subscribe, starting from the replay window.
    ///
    /// Subscribing to a closed hub yields the replay window and then ends.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.hub();
        for item in &hub.window {
            // The receiver is alive right here, so this cannot fail.
            let _ = tx.send(item.clone());
        }
        if !hub.closed {
            hub.subscribers.push(tx);
        }
        Subscription {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl<T> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

/// One subscriber's view of a [`Broadcast`] hub.
pub struct Subscription<T> {
    inner: UnboundedReceiverStream<T>,
}

impl<T> Subscription<T> {
    /// Receive the next item, or `None` once the hub is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.as_mut().recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Send> TakeSource<T> for Subscription<T> {
    async fn next_item(&mut self) -> Option<T> {
        self.recv().await
    }
}
