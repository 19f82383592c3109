//! The action channel.
//!
//! Host-dispatched actions are offered to a backed [`Queue`]; a pump task moves
//! them into a replaying [`Broadcast`] hub that every process subscribes to.
//! Subscribers are independent of each other (broadcast semantics), while the
//! queue is where the configured backing strategy applies.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tracing::{debug, trace, warn};

use crate::broadcast::{Broadcast, Subscription};
use crate::config::BridgeOptions;
use crate::core::Action;
use crate::error::TandemError;
use crate::inflight::{Inflight, InflightGuard};
use crate::queue::{Offered, Queue, TakeSource};

/// Queue plus broadcast stream of host-dispatched actions.
#[derive(Clone)]
pub struct ActionChannel {
    queue: Queue<Action>,
    hub: Broadcast<Action>,
    inflight: Arc<Inflight>,
}

impl ActionChannel {
    /// Create the channel described by `options`.
    pub fn new(options: &BridgeOptions, inflight: Arc<Inflight>) -> Self {
        Self {
            queue: Queue::new("action", options.backing),
            hub: Broadcast::new(options.replay),
            inflight,
        }
    }

    /// Offer an action for broadcast.
    ///
    /// Waits only under the `bounded` strategy when the queue is full. A
    /// dropped action is logged and reported through the returned [`Offered`].
    pub async fn offer(&self, action: Action) -> Result<Offered, TandemError> {
        let action_type = action.kind_arc();

        // Count before offering so the pump can never decrement first.
        self.inflight.inc(1);
        let offered = match self.queue.offer(action).await {
            Ok(offered) => offered,
            Err(e) => {
                self.inflight.dec(1);
                return Err(e);
            }
        };

        match offered {
            Offered::Accepted => {}
            Offered::Dropped => {
                self.inflight.dec(1);
                warn!(action_type = %action_type, strategy = "dropping", "action channel full, dropped action");
            }
            Offered::Displaced => {
                // The displaced action will never reach the pump.
                self.inflight.dec(1);
                warn!(action_type = %action_type, strategy = "sliding", "action channel full, dropped oldest action");
            }
        }
        Ok(offered)
    }

    /// Subscribe to the action stream, starting from the replay window.
    pub fn subscribe(&self) -> ActionStream {
        ActionStream {
            inner: self.hub.subscribe(),
        }
    }

    /// The producer side of the channel.
    ///
    /// Taking from the queue directly competes with the broadcast pump.
    pub fn queue(&self) -> &Queue<Action> {
        &self.queue
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Size of the replay window.
    pub fn replay(&self) -> usize {
        self.hub.replay()
    }

    /// Stop accepting actions. Queued actions are still broadcast, then every
    /// subscription ends.
    pub fn close(&self) {
        self.queue.shutdown();
    }

    /// Move actions from the queue to the broadcast hub until the queue is
    /// shut down and drained.
    pub(crate) async fn pump(self) {
        debug!(replay = self.hub.replay(), strategy = %self.queue.backing(), "action pump started");
        while let Some(action) = self.queue.take().await {
            let _done = InflightGuard::adopt(self.inflight.clone(), 1);
            let receivers = self.hub.publish(action.clone());
            trace!(action_type = %action, receivers, "action broadcast");
        }
        self.hub.close();
        debug!("action pump stopped");
    }
}

impl std::fmt::Debug for ActionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionChannel")
            .field("queue", &self.queue)
            .field("hub", &self.hub)
            .finish()
    }
}

/// A process's subscription to the action channel.
#[derive(Debug)]
pub struct ActionStream {
    inner: Subscription<Action>,
}

impl ActionStream {
    /// Receive the next action, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Action> {
        self.inner.recv().await
    }
}

impl Stream for ActionStream {
    type Item = Action;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Action>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait]
impl TakeSource<Action> for ActionStream {
    async fn next_item(&mut self) -> Option<Action> {
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backing;
    use futures::StreamExt;

    fn channel(options: BridgeOptions) -> (ActionChannel, Arc<Inflight>) {
        let inflight = Arc::new(Inflight::new());
        (ActionChannel::new(&options, inflight.clone()), inflight)
    }

    #[tokio::test]
    async fn test_offer_reaches_all_subscribers_in_order() {
        let (channel, inflight) = channel(BridgeOptions::default());
        let a = channel.subscribe();
        let b = channel.subscribe();
        let pump = tokio::spawn(channel.clone().pump());

        for kind in ["ONE", "TWO", "THREE"] {
            channel.offer(Action::new(kind)).await.unwrap();
        }
        inflight.wait_idle().await;
        channel.close();
        pump.await.unwrap();

        let expected = vec![Action::new("ONE"), Action::new("TWO"), Action::new("THREE")];
        assert_eq!(a.collect::<Vec<_>>().await, expected);
        assert_eq!(b.collect::<Vec<_>>().await, expected);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_window() {
        let (channel, inflight) = channel(BridgeOptions::default().with_replay(1));
        let pump = tokio::spawn(channel.clone().pump());

        channel.offer(Action::new("OLD")).await.unwrap();
        channel.offer(Action::new("RECENT")).await.unwrap();
        inflight.wait_idle().await;

        let late = channel.subscribe();
        channel.offer(Action::new("NEW")).await.unwrap();
        inflight.wait_idle().await;
        channel.close();
        pump.await.unwrap();

        assert_eq!(
            late.collect::<Vec<_>>().await,
            vec![Action::new("RECENT"), Action::new("NEW")]
        );
    }

    #[tokio::test]
    async fn test_dropping_strategy_keeps_inflight_balanced() {
        let options = BridgeOptions::default().with_backing(Backing::Dropping { capacity: 1 });
        let (channel, inflight) = channel(options);

        assert_eq!(channel.offer(Action::new("A")).await.unwrap(), Offered::Accepted);
        assert_eq!(channel.offer(Action::new("B")).await.unwrap(), Offered::Dropped);
        assert_eq!(inflight.pending(), 1);

        let sub = channel.subscribe();
        let pump = tokio::spawn(channel.clone().pump());
        inflight.wait_idle().await;
        channel.close();
        pump.await.unwrap();

        assert_eq!(sub.collect::<Vec<_>>().await, vec![Action::new("A")]);
    }

    #[tokio::test]
    async fn test_sliding_strategy_keeps_newest() {
        let options = BridgeOptions::default().with_backing(Backing::Sliding { capacity: 1 });
        let (channel, inflight) = channel(options);

        channel.offer(Action::new("A")).await.unwrap();
        assert_eq!(channel.offer(Action::new("B")).await.unwrap(), Offered::Displaced);
        assert_eq!(inflight.pending(), 1);

        let sub = channel.subscribe();
        let pump = tokio::spawn(channel.clone().pump());
        inflight.wait_idle().await;
        channel.close();
        pump.await.unwrap();

        assert_eq!(sub.collect::<Vec<_>>().await, vec![Action::new("B")]);
    }

    #[tokio::test]
    async fn test_offer_after_close_fails() {
        let (channel, inflight) = channel(BridgeOptions::default());
        channel.close();
        let err = channel.offer(Action::new("LATE")).await.unwrap_err();
        assert_eq!(err, TandemError::ChannelClosed { channel: "action" });
        assert!(inflight.is_idle());
    }
}
