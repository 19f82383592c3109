//! Processes: long-running units of work attached to a bridge.
//!
//! A [`Process`] is a named, not-yet-started body. It runs with a
//! [`ProcessContext`] giving it the coordination service, the injected
//! dependencies, and its interruption signal.
//!
//! # Constructors
//!
//! | Constructor                | Body                                                   |
//! |----------------------------|--------------------------------------------------------|
//! | [`Process::from_fn`]       | arbitrary async code over the context                  |
//! | [`Process::make`]          | `(actions, state) -> stream of actions to dispatch`    |
//! | [`Process::from_stream`]   | dispatch every element of a stream                     |
//! | [`Process::from_future`]   | dispatch the single action a future resolves to        |
//! | [`Process::all`]           | run processes concurrently, fail fast                  |
//!
//! # Failure boundaries
//!
//! By default a failure or panic anywhere in a tree built with [`Process::all`]
//! interrupts its siblings and ends the tree. [`Process::recover`] and
//! [`Process::isolated`] put an explicit boundary around a sub-tree.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::{try_join_all, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info_span, warn, Instrument, Span};

use crate::action::ActionStream;
use crate::core::{Action, Take};
use crate::service::CoordinationService;
use crate::state::{State, StateCell};
use crate::supervisor::{panic_message, spawn_supervised, ExitLog, TaskHandle};

/// The future a process body produces.
pub type ProcessFuture = BoxFuture<'static, anyhow::Result<()>>;

type Body<S, D> = Box<dyn FnOnce(ProcessContext<S, D>) -> ProcessFuture + Send>;

/// A named process body, started by a bridge or by [`ProcessContext::fork`].
pub struct Process<S, D = ()> {
    name: Arc<str>,
    body: Body<S, D>,
}

impl<S: State, D: Send + Sync + 'static> Process<S, D> {
    /// A process running arbitrary async code.
    ///
    /// ```ignore
    /// let logger = Process::from_fn("logger", |ctx| async move {
    ///     let mut actions = ctx.actions();
    ///     while let Some(action) = actions.recv().await {
    ///         tracing::info!(action_type = %action, "observed");
    ///     }
    ///     Ok(())
    /// });
    /// ```
    pub fn from_fn<F, Fut>(name: impl AsRef<str>, f: F) -> Self
    where
        F: FnOnce(ProcessContext<S, D>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            body: Box::new(move |ctx| f(ctx).boxed()),
        }
    }

    /// A process built from a processor callback.
    ///
    /// The processor receives a subscription to the action channel and the
    /// state cell, and returns a stream whose every element is dispatched to
    /// the host, in emission order.
    ///
    /// ```ignore
    /// let fire = Process::make("fire", |actions, _state| {
    ///     actions
    ///         .filter(|a| futures::future::ready(a.is("FIRE_1")))
    ///         .map(|_| Action::new("ACTION_1"))
    /// });
    /// ```
    pub fn make<F, St>(name: impl AsRef<str>, processor: F) -> Self
    where
        F: FnOnce(ActionStream, StateCell<S>) -> St + Send + 'static,
        St: Stream<Item = Action> + Send + 'static,
    {
        Self::from_fn(name, move |ctx| async move {
            let actions = ctx.actions();
            let output = processor(actions, ctx.service.state().clone());
            ctx.run_into_dispatch(output).await
        })
    }

    /// A process dispatching every element of `stream`.
    pub fn from_stream<St>(name: impl AsRef<str>, stream: St) -> Self
    where
        St: Stream<Item = Action> + Send + 'static,
    {
        Self::from_fn(name, move |ctx| async move { ctx.run_into_dispatch(stream).await })
    }

    /// A process dispatching the action `future` resolves to.
    ///
    /// A failed future is forwarded to the drain loop as a failed take, which
    /// stops it, and also fails the process.
    pub fn from_future<Fut>(name: impl AsRef<str>, future: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Result<Action>> + Send + 'static,
    {
        Self::from_fn(name, move |ctx| async move {
            let dispatch = ctx.service.dispatch();
            match future.await {
                Ok(action) => {
                    dispatch.put(action)?;
                    dispatch.offer(Take::End)?;
                    Ok(())
                }
                Err(e) => {
                    let _ = dispatch.offer(Take::Fail(Arc::from(format!("{e:#}"))));
                    Err(e)
                }
            }
        })
    }

    /// Run `processes` concurrently.
    ///
    /// The first failure or panic drops every sibling still running and ends
    /// this process with that failure.
    pub fn all(name: impl AsRef<str>, processes: impl IntoIterator<Item = Process<S, D>>) -> Self {
        let processes: Vec<_> = processes.into_iter().collect();
        Self::from_fn(name, move |ctx| async move {
            let running = processes.into_iter().map(|process| {
                let child = ctx.scoped(process.name.clone());
                process.run(child)
            });
            try_join_all(running).await?;
            Ok(())
        })
    }

    /// Contain this process's failures and panics.
    ///
    /// The failure is logged and handed to `handler`; if it returns an action,
    /// that action is put as a compensation. The wrapped process then counts
    /// as completed, so siblings keep running.
    pub fn recover<H>(self, handler: H) -> Self
    where
        H: FnOnce(&anyhow::Error) -> Option<Action> + Send + 'static,
    {
        let Process { name, body } = self;
        let label = name.clone();
        Self {
            name,
            body: Box::new(move |ctx: ProcessContext<S, D>| {
                let inner = body(ctx.clone());
                async move {
                    let error = match AssertUnwindSafe(inner).catch_unwind().await {
                        Ok(Ok(())) => return Ok(()),
                        Ok(Err(e)) => e,
                        Err(panic) => anyhow!("process panicked: {}", panic_message(panic.as_ref())),
                    };
                    warn!(process = %label, error = %format!("{error:#}"), "recovered process failure");
                    if let Some(compensation) = handler(&error) {
                        ctx.put(compensation)?;
                    }
                    Ok(())
                }
                .boxed()
            }),
        }
    }

    /// Contain this process's failures and panics without compensation.
    pub fn isolated(self) -> Self {
        self.recover(|_| None)
    }

    /// The process's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the body inside a `process` span.
    pub(crate) fn run(self, ctx: ProcessContext<S, D>) -> ProcessFuture {
        let span = info_span!("process", name = %self.name);
        (self.body)(ctx).instrument(span).boxed()
    }
}

impl<S, D> std::fmt::Debug for Process<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Everything a running process can reach.
///
/// The operators (`select`, `put`, `take`, `take_every`, ...) are methods on
/// this type.
pub struct ProcessContext<S, D = ()> {
    pub(crate) service: CoordinationService<S>,
    pub(crate) deps: Arc<D>,
    pub(crate) cancel: CancellationToken,
    pub(crate) runtime: Handle,
    pub(crate) grace: Duration,
    pub(crate) name: Arc<str>,
}

impl<S, D> Clone for ProcessContext<S, D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            deps: self.deps.clone(),
            cancel: self.cancel.clone(),
            runtime: self.runtime.clone(),
            grace: self.grace,
            name: self.name.clone(),
        }
    }
}

impl<S: State, D: Send + Sync + 'static> ProcessContext<S, D> {
    pub(crate) fn new(
        service: CoordinationService<S>,
        deps: Arc<D>,
        cancel: CancellationToken,
        runtime: Handle,
        grace: Duration,
        name: Arc<str>,
    ) -> Self {
        Self {
            service,
            deps,
            cancel,
            runtime,
            grace,
            name,
        }
    }

    /// The coordination service.
    pub fn service(&self) -> &CoordinationService<S> {
        &self.service
    }

    /// The dependencies injected with `BridgeBuilder::deps`.
    pub fn deps(&self) -> &D {
        &self.deps
    }

    /// This process's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves when this process is interrupted.
    ///
    /// Only useful with an interrupt grace period: without one, an
    /// interrupted process is dropped at its next suspension point.
    pub fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Whether this process has been interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A fresh subscription to the action channel.
    pub fn actions(&self) -> ActionStream {
        self.service.action().subscribe()
    }

    /// Start `process` as an independent task.
    ///
    /// Its failure does not affect this process. Interrupting this process
    /// (or the bridge) interrupts it too.
    pub fn fork(&self, process: Process<S, D>) -> TaskHandle {
        let child = self.scoped(process.name.clone());
        let token = child.cancel.clone();
        spawn_supervised(
            &self.runtime,
            process.name.clone(),
            token,
            self.grace,
            ExitLog::Loud,
            Span::current(),
            process.run(child),
        )
    }

    /// Dispatch every element of `output`, then mark this producer finished.
    pub async fn run_into_dispatch<St>(&self, output: St) -> anyhow::Result<()>
    where
        St: Stream<Item = Action> + Send,
    {
        let mut output = std::pin::pin!(output);
        let dispatch = self.service.dispatch();
        while let Some(action) = output.next().await {
            dispatch.put(action)?;
        }
        dispatch.offer(Take::End)?;
        Ok(())
    }

    /// Context for a sub-process, interrupted along with this one.
    pub(crate) fn scoped(&self, name: Arc<str>) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            name,
            ..self.clone()
        }
    }
}

impl<S, D> std::fmt::Debug for ProcessContext<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("name", &self.name)
            .field("bridge", &self.service.id())
            .field("interrupted", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
