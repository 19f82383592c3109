//! Supervised tasks.
//!
//! Every process tree, forked process, and `take_every` worker runs as a
//! supervised tokio task:
//!
//! - its future runs under `catch_unwind`, so a panic becomes [`Exit::Defect`]
//!   instead of tearing down the runtime
//! - it is raced against a [`CancellationToken`]; cancelling the token drops
//!   the future at its next suspension point, after an optional grace period
//! - a failure or panic cancels the task's token, interrupting everything it
//!   forked
//! - its terminal [`Exit`] is published to every [`TaskHandle`] clone, so
//!   `join` can be called any number of times

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument, Span};

/// Terminal outcome of a supervised task.
#[derive(Debug, Clone)]
pub enum Exit {
    /// The task completed.
    Success,
    /// The task returned an error.
    Failure(Arc<anyhow::Error>),
    /// The task panicked. Carries the panic message.
    Defect(String),
    /// The task was interrupted.
    Interrupted,
}

impl Exit {
    /// Whether the task completed normally.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success)
    }

    /// Whether the task was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Interrupted)
    }

    /// Whether the task failed or panicked.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_) | Exit::Defect(_))
    }

    /// The error a failed task returned.
    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            Exit::Failure(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Success => f.write_str("success"),
            Exit::Failure(e) => write!(f, "failure: {e:#}"),
            Exit::Defect(msg) => write!(f, "defect: {msg}"),
            Exit::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Extract a message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a supervised task.
///
/// Cloning the handle is cheap; every clone observes the same exit.
#[derive(Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<Exit>>,
    started: watch::Receiver<bool>,
}

impl TaskHandle {
    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request interruption. Calling this on a finished or already
    /// interrupted task is a no-op.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task's exit.
    pub async fn join(&self) -> Exit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(Exit::Interrupted),
            // The task was dropped without reporting, e.g. on runtime shutdown.
            Err(_) => Exit::Interrupted,
        };
        exit
    }

    /// Interrupt, then wait for the exit.
    pub async fn interrupt_and_join(&self) -> Exit {
        self.interrupt();
        self.join().await
    }

    /// The exit, if the task has finished.
    pub fn exit(&self) -> Option<Exit> {
        self.exit.borrow().clone()
    }

    /// Whether the task has finished.
    pub fn is_finished(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// The token that interrupts this task.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the task's future has been polled once.
    pub(crate) async fn started(&self) {
        let mut started = self.started.clone();
        let _ = started.wait_for(|s| *s).await;
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

/// How a supervised task reports its exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitLog {
    /// Failures are errors (process trees).
    Loud,
    /// Failures are warnings (independent workers).
    Quiet,
}

/// Spawn `future` as a supervised task on `handle`.
pub(crate) fn spawn_supervised<F>(
    handle: &Handle,
    name: Arc<str>,
    cancel: CancellationToken,
    grace: Duration,
    log: ExitLog,
    span: Span,
    future: F,
) -> TaskHandle
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (exit_tx, exit_rx) = watch::channel(None);
    let (started_tx, started_rx) = watch::channel(false);

    let task = {
        let name = name.clone();
        let cancel = cancel.clone();
        async move {
            let exit = supervise(future, &cancel, grace, &started_tx).await;
            report(&name, &exit, log);
            // A failed task takes everything it forked down with it.
            if exit.is_failure() {
                cancel.cancel();
            }
            exit_tx.send_replace(Some(exit));
        }
    };
    handle.spawn(task.instrument(span));

    TaskHandle {
        name,
        cancel,
        exit: exit_rx,
        started: started_rx,
    }
}

async fn supervise<F>(
    future: F,
    cancel: &CancellationToken,
    grace: Duration,
    started: &watch::Sender<bool>,
) -> Exit
where
    F: Future<Output = anyhow::Result<()>> + Send,
{
    if cancel.is_cancelled() {
        started.send_replace(true);
        return Exit::Interrupted;
    }

    let mut future = Box::pin(AssertUnwindSafe(future).catch_unwind());

    // Poll once before anything else can observe the task as started, so
    // subscriptions made synchronously at the start of the task exist.
    let first = futures::poll!(future.as_mut());
    started.send_replace(true);

    let outcome = match first {
        Poll::Ready(outcome) => outcome,
        // The future is polled first so a task that reacts to its own token
        // can finish the work it already has in hand.
        Poll::Pending => tokio::select! {
            biased;
            outcome = future.as_mut() => outcome,
            _ = cancel.cancelled() => {
                if !grace.is_zero() {
                    let _ = tokio::time::timeout(grace, future.as_mut()).await;
                }
                return Exit::Interrupted;
            }
        },
    };

    match outcome {
        Ok(Ok(())) if cancel.is_cancelled() => Exit::Interrupted,
        Ok(Ok(())) => Exit::Success,
        Ok(Err(e)) => Exit::Failure(Arc::new(e)),
        Err(panic) => Exit::Defect(panic_message(panic.as_ref())),
    }
}

fn report(name: &str, exit: &Exit, log: ExitLog) {
    match (exit, log) {
        (Exit::Success, _) => info!(process = name, "process completed"),
        (Exit::Interrupted, _) => info!(process = name, "process interrupted"),
        (Exit::Failure(e), ExitLog::Loud) => error!(process = name, error = %format!("{e:#}"), "process failed"),
        (Exit::Defect(msg), ExitLog::Loud) => error!(process = name, panic = %msg, "process panicked"),
        (Exit::Failure(e), ExitLog::Quiet) => tracing::warn!(process = name, error = %format!("{e:#}"), "worker failed"),
        (Exit::Defect(msg), ExitLog::Quiet) => tracing::warn!(process = name, panic = %msg, "worker panicked"),
    }
}
