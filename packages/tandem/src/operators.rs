//! The operator vocabulary processes are written in.
//!
//! | Operator                           | Suspends | Result                                  |
//! |------------------------------------|----------|-----------------------------------------|
//! | [`select`](ProcessContext::select) | no       | selector applied to the current state   |
//! | [`put`](ProcessContext::put)       | no       | the action's type                       |
//! | [`take`](ProcessContext::take)     | yes      | first matching action, `None` if ended  |
//! | [`take_required`](ProcessContext::take_required) | yes | first matching action or `TakeExhausted` |
//! | [`take_from`]                      | yes      | like `take`, over any [`TakeSource`]    |
//! | [`take_every`](ProcessContext::take_every) | no | handle to the watcher task             |

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info_span, Span};

use crate::core::{Action, ActionType, Take};
use crate::error::TandemError;
use crate::process::ProcessContext;
use crate::queue::TakeSource;
use crate::state::State;
use crate::supervisor::{spawn_supervised, ExitLog, TaskHandle};

/// Suspend until `source` yields an item matching `predicate`.
///
/// Non-matching items are consumed and discarded. Returns `None` if the
/// source ends first.
///
/// ```ignore
/// let (tx, mut rx) = tokio::sync::mpsc::channel(16);
/// let job = take_from(&mut rx, |job: &Job| job.priority > 3).await;
/// ```
pub async fn take_from<T, Src, P>(source: &mut Src, predicate: P) -> Option<T>
where
    Src: TakeSource<T> + ?Sized,
    P: Fn(&T) -> bool,
{
    while let Some(item) = source.next_item().await {
        if predicate(&item) {
            return Some(item);
        }
    }
    None
}

impl<S: State, D: Send + Sync + 'static> ProcessContext<S, D> {
    /// Apply `selector` to the current state snapshot.
    pub fn select<R>(&self, selector: impl FnOnce(&S) -> R) -> R {
        self.service.state().read_with(selector)
    }

    /// The current state snapshot.
    pub fn state(&self) -> S {
        self.service.state().read()
    }

    /// Dispatch `action` to the host through the drain loop.
    ///
    /// Returns the action's type. Sequential puts from one process reach the
    /// host in program order.
    pub fn put(&self, action: Action) -> Result<ActionType, TandemError> {
        let kind = action.kind_arc();
        self.service.dispatch().put(action)?;
        debug!(action_type = %kind, "put");
        Ok(kind)
    }

    /// Dispatch several actions back to back, as one take.
    ///
    /// Returns how many were enqueued.
    pub fn put_many(&self, actions: impl IntoIterator<Item = Action>) -> Result<usize, TandemError> {
        let take = Take::chunk(actions);
        let n = take.len();
        if n > 0 {
            self.service.dispatch().offer(take)?;
            debug!(count = n, "put chunk");
        }
        Ok(n)
    }

    /// Suspend until an action matching `predicate` is dispatched to the host.
    ///
    /// Subscribes at call time, so the replay window is searched first.
    /// Returns `None` if the action channel closes first.
    pub async fn take<P>(&self, predicate: P) -> Option<Action>
    where
        P: Fn(&Action) -> bool,
    {
        let mut actions = self.actions();
        take_from(&mut actions, predicate).await
    }

    /// Like [`take`](Self::take), but an ended channel is an error.
    ///
    /// Propagating the error with `?` aborts the process.
    pub async fn take_required<P>(&self, predicate: P) -> Result<Action, TandemError>
    where
        P: Fn(&Action) -> bool,
    {
        self.take(predicate).await.ok_or(TandemError::TakeExhausted)
    }

    /// Fork `worker(action, args)` for every matching action, without waiting
    /// for earlier workers.
    ///
    /// Returns the handle of the watcher loop. Interrupting the watcher stops
    /// new forks only: workers already forked keep running to completion.
    /// Interrupting this process or the bridge interrupts the watcher and
    /// every worker. Nothing is forked once the watcher is interrupted, even
    /// for actions already buffered.
    ///
    /// A failing worker is logged and does not affect the watcher or its
    /// siblings.
    ///
    /// ```ignore
    /// let watcher = ctx.take_every(of_type("FETCH"), api.clone(), |action, api| async move {
    ///     let user = api.fetch(action.payload()).await?;
    ///     Ok(())
    /// });
    /// ```
    pub fn take_every<P, A, W, Fut>(&self, predicate: P, args: A, worker: W) -> TaskHandle
    where
        P: Fn(&Action) -> bool + Send + 'static,
        A: Clone + Send + 'static,
        W: Fn(Action, A) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // Subscribe now so nothing dispatched after this call is missed.
        let mut actions = self.actions();
        let watcher_token = self.cancel.child_token();
        let name: Arc<str> = Arc::from(format!("{}/take_every", self.name));

        let watch = {
            let ctx = self.clone();
            let token = watcher_token.clone();
            async move {
                let mut forked = 0usize;
                loop {
                    let action = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        action = actions.recv() => action,
                    };
                    let Some(action) = action else { break };
                    if !predicate(&action) {
                        continue;
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    forked += 1;
                    debug!(action_type = %action, forked, "forking worker");
                    ctx.spawn_worker(forked, worker(action, args.clone()));
                }
                debug!(forked, "watcher stopped");
                Ok(())
            }
        };

        spawn_supervised(
            &self.runtime,
            name.clone(),
            watcher_token,
            self.grace,
            ExitLog::Loud,
            info_span!(parent: Span::current(), "take_every", process = %name),
            watch,
        )
    }

    fn spawn_worker<Fut>(&self, n: usize, work: Fut) -> TaskHandle
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(format!("{}/worker-{n}", self.name));
        spawn_supervised(
            &self.runtime,
            name.clone(),
            self.cancel.child_token(),
            self.grace,
            ExitLog::Quiet,
            info_span!("worker", process = %name),
            work,
        )
    }
}
