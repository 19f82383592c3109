//! The dispatch channel and its drain loop.
//!
//! Processes write [`Take`]s; exactly one drain loop reads them and re-dispatches
//! every action into the host, one at a time, from its own task. Dispatching
//! from a dedicated loop instead of the caller's stack is what keeps a process
//! reacting to its own dispatch from recursing into the host.
//!
//! # Failure
//!
//! A host dispatch that errors or panics fails the drain loop. The loop is
//! not restarted; the bridge is marked faulted and no further
//! process-originated actions reach the host.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::core::{Action, Take};
use crate::error::TandemError;
use crate::inflight::{Inflight, InflightGuard};
use crate::store::MiddlewareApi;
use crate::supervisor::panic_message;

/// Multi-producer, single-consumer channel of takes.
#[derive(Clone)]
pub struct DispatchChannel {
    tx: mpsc::UnboundedSender<Take>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Take>>>>,
    inflight: Arc<Inflight>,
}

impl DispatchChannel {
    /// Create an empty channel.
    pub fn new(inflight: Arc<Inflight>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            inflight,
        }
    }

    /// Enqueue a take for the drain loop.
    ///
    /// Fails once the drain loop has stopped.
    pub fn offer(&self, take: Take) -> Result<(), TandemError> {
        let n = take.len();
        self.inflight.inc(n);
        if self.tx.send(take).is_err() {
            self.inflight.dec(n);
            return Err(TandemError::ChannelClosed {
                channel: "dispatch",
            });
        }
        Ok(())
    }

    /// Enqueue a single action.
    pub fn put(&self, action: Action) -> Result<(), TandemError> {
        self.offer(Take::of(action))
    }

    /// Take the consuming side. Succeeds exactly once.
    pub fn stream(&self) -> Result<DispatchStream, TandemError> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| DispatchStream {
                rx,
                inflight: self.inflight.clone(),
            })
            .ok_or(TandemError::DrainAlreadyStarted)
    }

    /// Whether the consuming side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for DispatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChannel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The consuming side of a [`DispatchChannel`].
pub struct DispatchStream {
    rx: mpsc::UnboundedReceiver<Take>,
    inflight: Arc<Inflight>,
}

impl DispatchStream {
    /// Receive the next take.
    pub async fn recv(&mut self) -> Option<Take> {
        self.rx.recv().await
    }

    /// Close the channel and drop everything still queued, releasing its
    /// inflight count.
    fn discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while let Ok(take) = self.rx.try_recv() {
            discarded += take.len();
            self.inflight.dec(take.len());
        }
        discarded
    }
}

impl Drop for DispatchStream {
    fn drop(&mut self) {
        let discarded = self.discard();
        if discarded > 0 {
            debug!(discarded, "dropped undelivered process actions");
        }
    }
}

/// Run the drain loop until `scope` is cancelled, every producer is gone, or
/// a dispatch fails.
pub(crate) async fn drain<S>(
    mut stream: DispatchStream,
    api: Arc<dyn MiddlewareApi<S>>,
    scope: CancellationToken,
) -> Result<(), TandemError> {
    info!("drain loop started");

    loop {
        let take = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                info!("drain loop stopped");
                return Ok(());
            }
            take = stream.recv() => take,
        };

        let Some(take) = take else {
            info!("all producers gone, drain loop stopped");
            return Ok(());
        };

        let _done = InflightGuard::adopt(stream.inflight.clone(), take.len());
        match take {
            Take::Chunk(actions) => {
                for action in actions {
                    if scope.is_cancelled() {
                        info!("drain loop stopped");
                        return Ok(());
                    }
                    dispatch_one(api.as_ref(), action)?;
                }
            }
            Take::End => trace!("producer finished"),
            Take::Fail(message) => {
                error!(error = %message, "process output failed, stopping drain loop");
                return Err(TandemError::ProducerFailed {
                    message: message.to_string(),
                });
            }
        }
    }
}

fn dispatch_one<S>(api: &dyn MiddlewareApi<S>, action: Action) -> Result<(), TandemError> {
    let action_type = action.kind().to_string();
    trace!(action_type = %action_type, "dispatching process action to host");

    let result = catch_unwind(AssertUnwindSafe(|| api.dispatch(action)));
    let message = match result {
        Ok(Ok(_)) => return Ok(()),
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => format!("host dispatch panicked: {}", panic_message(panic.as_ref())),
    };

    error!(action_type = %action_type, error = %message, "host dispatch failed, stopping drain loop");
    Err(TandemError::DispatchFailed {
        action_type,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
        cancel_on: Option<(&'static str, CancellationToken)>,
    }

    impl MiddlewareApi<()> for Recorder {
        fn get_state(&self) {}

        fn dispatch(&self, action: Action) -> crate::store::DispatchResult {
            if self.panic_on == Some(action.kind()) {
                panic!("host blew up");
            }
            if self.fail_on == Some(action.kind()) {
                return Err(anyhow!("reducer rejected {}", action.kind()));
            }
            self.seen.lock().unwrap().push(action.kind().to_string());
            if let Some((kind, scope)) = &self.cancel_on {
                if action.is(kind) {
                    scope.cancel();
                }
            }
            Ok(Value::Null)
        }
    }

    fn setup(recorder: Recorder) -> (DispatchChannel, Arc<Recorder>, Arc<Inflight>) {
        let inflight = Arc::new(Inflight::new());
        (
            DispatchChannel::new(inflight.clone()),
            Arc::new(recorder),
            inflight,
        )
    }

    fn api(recorder: &Arc<Recorder>) -> Arc<dyn MiddlewareApi<()>> {
        recorder.clone()
    }

    #[tokio::test]
    async fn test_drain_dispatches_in_order_and_survives_end() {
        let (channel, recorder, inflight) = setup(Recorder::default());
        let scope = CancellationToken::new();
        let task = tokio::spawn(drain(channel.stream().unwrap(), api(&recorder), scope.clone()));

        channel.put(Action::new("A")).unwrap();
        channel.offer(Take::End).unwrap();
        channel
            .offer(Take::chunk([Action::new("B"), Action::new("C")]))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), inflight.wait_idle())
            .await
            .expect("drain should catch up");
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "B", "C"]);

        scope.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stream_taken_once() {
        let (channel, _, _) = setup(Recorder::default());
        let _stream = channel.stream().unwrap();
        assert!(matches!(
            channel.stream(),
            Err(TandemError::DrainAlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_error_terminates_drain() {
        let (channel, recorder, inflight) = setup(Recorder {
            fail_on: Some("BAD"),
            ..Default::default()
        });
        let task = tokio::spawn(drain(
            channel.stream().unwrap(),
            api(&recorder),
            CancellationToken::new(),
        ));

        channel.put(Action::new("OK")).unwrap();
        channel.put(Action::new("BAD")).unwrap();
        channel.put(Action::new("NEVER")).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TandemError::DispatchFailed { ref action_type, .. } if action_type == "BAD"));
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["OK"]);

        // The loop is gone: puts now fail and nothing stays inflight.
        assert!(channel.put(Action::new("LATE")).is_err());
        assert!(inflight.is_idle());
    }

    #[tokio::test]
    async fn test_dispatch_panic_is_contained() {
        let (channel, recorder, _) = setup(Recorder {
            panic_on: Some("PANIC"),
            ..Default::default()
        });
        channel.put(Action::new("PANIC")).unwrap();

        let err = drain(channel.stream().unwrap(), api(&recorder), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TandemError::DispatchFailed { message, .. } => assert!(message.contains("host blew up")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_drain_mid_chunk() {
        let scope = CancellationToken::new();
        let (channel, recorder, inflight) = setup(Recorder {
            cancel_on: Some(("STOP", scope.clone())),
            ..Default::default()
        });
        let stream = channel.stream().unwrap();
        channel
            .offer(Take::chunk([
                Action::new("A"),
                Action::new("STOP"),
                Action::new("NEVER"),
            ]))
            .unwrap();
        channel.put(Action::new("NEVER_EITHER")).unwrap();

        assert!(drain(stream, api(&recorder), scope).await.is_ok());
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "STOP"]);
        assert!(inflight.is_idle());
    }

    #[tokio::test]
    async fn test_failed_take_is_fatal() {
        let (channel, recorder, _) = setup(Recorder::default());
        channel.offer(Take::Fail(Arc::from("producer broke"))).unwrap();
        channel.put(Action::new("AFTER")).unwrap();

        let err = drain(channel.stream().unwrap(), api(&recorder), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::ProducerFailed { .. }));
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
