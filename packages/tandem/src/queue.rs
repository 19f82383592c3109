//! Multi-producer, multi-consumer queue with a configurable backing strategy.
//!
//! This is the producer side of the action channel. The strategy decides what
//! happens when a bounded queue is full:
//!
//! | Strategy    | Full queue behavior                    |
//! |-------------|----------------------------------------|
//! | `unbounded` | never full                             |
//! | `bounded`   | `offer` waits for a consumer           |
//! | `dropping`  | the offered item is discarded          |
//! | `sliding`   | the oldest queued item is discarded    |
//!
//! Consumers compete: each item is taken by exactly one `take` call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::Backing;
use crate::error::TandemError;

/// What happened to an offered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    /// The item was queued.
    Accepted,
    /// The queue was full and the item was discarded.
    Dropped,
    /// The item was queued and the oldest item was discarded to make room.
    Displaced,
}

impl Offered {
    /// Whether the offered item is now in the queue.
    pub fn is_queued(&self) -> bool {
        !matches!(self, Offered::Dropped)
    }
}

struct Slots<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    name: &'static str,
    backing: Backing,
    slots: Mutex<Slots<T>>,
    readable: Notify,
    writable: Notify,
}

/// A cloneable handle to a backed queue.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Create a queue. `name` is used in errors and logs.
    pub fn new(name: &'static str, backing: Backing) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                backing,
                slots: Mutex::new(Slots {
                    items: VecDeque::new(),
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// The queue's backing strategy.
    pub fn backing(&self) -> Backing {
        self.shared.backing
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer an item, waiting for space only under the `bounded` strategy.
    pub async fn offer(&self, item: T) -> Result<Offered, TandemError> {
        let mut item = item;
        loop {
            // Register before checking so a concurrent take cannot be missed.
            let writable = self.shared.writable.notified();
            match self.try_offer(item) {
                Ok(offered) => return Ok(offered),
                Err(Full::Closed) => {
                    return Err(TandemError::ChannelClosed {
                        channel: self.shared.name,
                    })
                }
                Err(Full::Wait(returned)) => {
                    trace!(queue = self.shared.name, "queue full, waiting for space");
                    item = returned;
                    writable.await;
                }
            }
        }
    }

    fn try_offer(&self, item: T) -> Result<Offered, Full<T>> {
        let mut slots = self.slots();
        if slots.closed {
            return Err(Full::Closed);
        }

        let offered = match self.shared.backing {
            Backing::Unbounded => {
                slots.items.push_back(item);
                Offered::Accepted
            }
            Backing::Bounded { capacity } => {
                if slots.items.len() >= capacity {
                    return Err(Full::Wait(item));
                }
                slots.items.push_back(item);
                Offered::Accepted
            }
            Backing::Dropping { capacity } => {
                if slots.items.len() >= capacity {
                    return Ok(Offered::Dropped);
                }
                slots.items.push_back(item);
                Offered::Accepted
            }
            Backing::Sliding { capacity } => {
                let displaced = slots.items.len() >= capacity;
                if displaced {
                    slots.items.pop_front();
                }
                slots.items.push_back(item);
                if displaced {
                    Offered::Displaced
                } else {
                    Offered::Accepted
                }
            }
        };
        drop(slots);

        self.shared.readable.notify_one();
        Ok(offered)
    }

    /// Take the next item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut slots = self.slots();
                if let Some(item) = slots.items.pop_front() {
                    let more = !slots.items.is_empty();
                    drop(slots);
                    self.shared.writable.notify_one();
                    if more {
                        self.shared.readable.notify_one();
                    }
                    return Some(item);
                }
                if slots.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Stop accepting offers. Queued items can still be taken.
    pub fn shutdown(&self) {
        self.slots().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.slots().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.slots().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Full<T> {
    Wait(T),
    Closed,
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.shared.name)
            .field("backing", &self.shared.backing)
            .finish_non_exhaustive()
    }
}

/// Anything a process can pull items from one at a time.
///
/// Implemented for tokio channel receivers, boxed streams, bridge
/// subscriptions, and [`Queue`]. Used by [`take_from`](crate::take_from).
#[async_trait]
pub trait TakeSource<T>: Send {
    /// The next item, or `None` once the source has ended.
    async fn next_item(&mut self) -> Option<T>;
}

#[async_trait]
impl<T: Send> TakeSource<T> for Queue<T> {
    async fn next_item(&mut self) -> Option<T> {
        self.take().await
    }
}

#[async_trait]
impl<T: Send> TakeSource<T> for tokio::sync::mpsc::Receiver<T> {
    async fn next_item(&mut self) -> Option<T> {
        self.recv().await
    }
}

#[async_trait]
impl<T: Send> TakeSource<T> for tokio::sync::mpsc::UnboundedReceiver<T> {
    async fn next_item(&mut self) -> Option<T> {
        self.recv().await
    }
}

#[async_trait]
impl<T: Clone + Send> TakeSource<T> for tokio::sync::broadcast::Receiver<T> {
    async fn next_item(&mut self) -> Option<T> {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            match self.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "take source lagged, skipped items");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl<'a, T: Send> TakeSource<T> for futures::stream::BoxStream<'a, T> {
    async fn next_item(&mut self) -> Option<T> {
        futures::StreamExt::next(self).await
    }
}
