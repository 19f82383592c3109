//! The bridge: one supervised process tree attached to one host store.
//!
//! Construction happens in two phases:
//!
//! 1. [`BridgeBuilder::spawn`] allocates the coordination service and forks the
//!    root process immediately.
//! 2. [`Bridge::middleware`] is installed into the host store. When the store
//!    builds its chain, the middleware attaches: it publishes the initial
//!    state, starts the drain loop, and returns the dispatch interceptor.
//!
//! # Data flow
//!
//! ```text
//! host dispatch ─► interceptor ─► next (reducers) ─► result to caller
//!                       │
//!                       └─► ingress ─► state cell, action channel ─► processes
//!                                                                      │
//! host dispatch ◄── drain loop ◄── dispatch channel ◄────── put ───────┘
//! ```
//!
//! The interceptor calls `next` before anything else, so host reducers see an
//! action strictly before any process does.
//!
//! # Example
//!
//! ```ignore
//! let bridge = Bridge::builder()
//!     .options(BridgeOptions::default().with_replay(1))
//!     .spawn(Process::all("root", [fire_1, fire_2]))?;
//!
//! let store = Store::builder(reducer)
//!     .middleware(bridge.middleware())
//!     .build()?;
//!
//! store.dispatch(Action::new("FIRE_1"))?;
//! bridge.settle().await;
//!
//! bridge.shutdown().await;
//! ```

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, trace, warn, Instrument, Span};

use crate::config::BridgeOptions;
use crate::core::{Action, BridgeId};
use crate::dispatch;
use crate::error::TandemError;
use crate::inflight::InflightGuard;
use crate::process::{Process, ProcessContext};
use crate::service::CoordinationService;
use crate::state::State;
use crate::store::{Middleware, MiddlewareApi, Next};
use crate::supervisor::{spawn_supervised, Exit, ExitLog, TaskHandle};

/// Whether the bridge can still deliver actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Actions flow in both directions.
    Running,
    /// A fatal error stopped the bridge: a channel or drain failure, or the
    /// root process failing or panicking. Host dispatches still reach the
    /// reducers, but processes no longer hear about them or dispatch back,
    /// and every process, fork, and worker is interrupted.
    Faulted(TandemError),
    /// The bridge was shut down.
    ShutDown,
}

impl BridgeStatus {
    /// Whether the bridge is running.
    pub fn is_running(&self) -> bool {
        matches!(self, BridgeStatus::Running)
    }
}

/// Two-phase constructor for a [`Bridge`].
pub struct BridgeBuilder<D = ()> {
    options: BridgeOptions,
    deps: Arc<D>,
    runtime: Option<Handle>,
}

impl BridgeBuilder<()> {
    /// A builder with default options and no dependencies.
    pub fn new() -> Self {
        Self {
            options: BridgeOptions::default(),
            deps: Arc::new(()),
            runtime: None,
        }
    }
}

impl Default for BridgeBuilder<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Send + Sync + 'static> BridgeBuilder<D> {
    /// Set the bridge options.
    pub fn options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Inject dependencies into every process (`ctx.deps()`).
    pub fn deps<E: Send + Sync + 'static>(self, deps: E) -> BridgeBuilder<E> {
        self.shared_deps(Arc::new(deps))
    }

    /// Inject already shared dependencies.
    pub fn shared_deps<E: Send + Sync + 'static>(self, deps: Arc<E>) -> BridgeBuilder<E> {
        BridgeBuilder {
            options: self.options,
            deps,
            runtime: self.runtime,
        }
    }

    /// Run the bridge on `handle` instead of the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Allocate the coordination service and fork `root` immediately.
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidOptions`] if the options fail validation
    /// - [`TandemError::NoRuntime`] if no runtime was given and none is running
    pub fn spawn<S: State>(self, root: Process<S, D>) -> Result<Bridge<S>, TandemError> {
        self.options.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| TandemError::NoRuntime)?,
        };

        let id = BridgeId::new();
        let span = info_span!("bridge", bridge = %id);
        let service = CoordinationService::new(id, &self.options);
        let scope = CancellationToken::new();

        info!(
            parent: &span,
            root = root.name(),
            replay = self.options.replay,
            strategy = %self.options.backing,
            "starting bridge"
        );

        let pump = runtime.spawn(service.action().clone().pump().instrument(span.clone()));

        let name: Arc<str> = Arc::from(root.name());
        let ctx = ProcessContext::new(
            service.clone(),
            self.deps,
            scope.child_token(),
            runtime.clone(),
            self.options.interrupt_grace,
            name.clone(),
        );
        let token = ctx.cancel.clone();
        let root = spawn_supervised(
            &runtime,
            name,
            token,
            self.options.interrupt_grace,
            ExitLog::Loud,
            span.clone(),
            root.run(ctx),
        );

        let (status, _) = watch::channel(BridgeStatus::Running);
        let status = Arc::new(status);
        let faults = Faults {
            id,
            status: status.clone(),
            scope: scope.clone(),
        };
        let monitor = runtime.spawn(watch_root(root.clone(), faults).instrument(span.clone()));

        Ok(Bridge {
            inner: Arc::new(BridgeInner {
                id,
                options: self.options,
                service,
                runtime,
                span,
                root,
                scope,
                status,
                attached: AtomicBool::new(false),
                tasks: Mutex::new(vec![pump, monitor]),
            }),
        })
    }
}

/// A running process tree bound to a host store.
///
/// Dropping the last handle (and the middleware, if never installed) tears
/// the bridge down without waiting; prefer [`shutdown`](Self::shutdown).
pub struct Bridge<S> {
    inner: Arc<BridgeInner<S>>,
}

impl<S> Clone for Bridge<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Bridge<()> {
    /// Start building a bridge.
    pub fn builder() -> BridgeBuilder<()> {
        BridgeBuilder::new()
    }
}

impl<S: State> Bridge<S> {
    /// Fork `root` with default options on the current runtime.
    pub fn new(root: Process<S>) -> Result<Self, TandemError> {
        BridgeBuilder::new().spawn(root)
    }

    /// This bridge's ID.
    pub fn id(&self) -> BridgeId {
        self.inner.id
    }

    /// The options the bridge was built with.
    pub fn options(&self) -> &BridgeOptions {
        &self.inner.options
    }

    /// The coordination service shared by every process.
    pub fn service(&self) -> &CoordinationService<S> {
        &self.inner.service
    }

    /// The middleware to install into the host store.
    ///
    /// It can be attached once; a second attach fails with
    /// [`TandemError::AlreadyAttached`].
    pub fn middleware(&self) -> BridgeMiddleware<S> {
        BridgeMiddleware {
            inner: self.inner.clone(),
        }
    }

    /// Interrupt the whole process tree. Idempotent.
    ///
    /// The drain loop keeps running, so actions already put still reach the
    /// host.
    pub fn interrupt(&self) {
        if !self.inner.root.is_finished() {
            info!(bridge = %self.inner.id, "interrupting process tree");
        }
        self.inner.root.interrupt();
    }

    /// Wait for the process tree's exit. Can be called any number of times.
    pub async fn join(&self) -> Exit {
        self.inner.root.join().await
    }

    /// The root task's handle.
    pub fn root(&self) -> &TaskHandle {
        &self.inner.root
    }

    /// Current status.
    pub fn status(&self) -> BridgeStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until no put, intercepted host action, or queued action is in
    /// flight.
    ///
    /// Processes may still be reacting to actions they have received.
    pub async fn settle(&self) {
        self.inner.service.inflight().wait_idle().await;
    }

    /// [`settle`](Self::settle) with a timeout.
    pub async fn settle_timeout(&self, duration: Duration) -> Result<(), TandemError> {
        tokio::time::timeout(duration, self.settle())
            .await
            .map_err(|_| TandemError::Timeout { duration })
    }

    /// Interrupt the tree, wait for it, then stop the drain loop and close
    /// every channel. Idempotent; returns the tree's exit.
    pub async fn shutdown(&self) -> Exit {
        let exit = self.inner.root.interrupt_and_join().await;

        self.inner.scope.cancel();
        self.inner.service.close();
        self.inner.status.send_if_modified(|status| {
            if status.is_running() {
                *status = BridgeStatus::ShutDown;
                true
            } else {
                false
            }
        });

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(bridge = %self.inner.id, error = %e, "bridge task ended abnormally");
            }
        }

        info!(bridge = %self.inner.id, exit = %exit, "bridge shut down");
        exit
    }
}

impl<S> std::fmt::Debug for Bridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.inner.id)
            .field("status", &*self.inner.status.borrow())
            .field("root", &self.inner.root)
            .finish()
    }
}

struct BridgeInner<S> {
    id: BridgeId,
    options: BridgeOptions,
    service: CoordinationService<S>,
    runtime: Handle,
    span: Span,
    root: TaskHandle,
    scope: CancellationToken,
    status: Arc<watch::Sender<BridgeStatus>>,
    attached: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: State> BridgeInner<S> {
    fn faults(&self) -> Faults {
        Faults {
            id: self.id,
            status: self.status.clone(),
            scope: self.scope.clone(),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn attach(&self, api: Arc<dyn MiddlewareApi<S>>, next: Next) -> Result<Next, TandemError> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Err(TandemError::AlreadyAttached);
        }
        let stream = self.service.dispatch().stream()?;

        self.service.state().set(api.get_state());

        let faults = self.faults();
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        self.track(self.runtime.spawn(
            ingress(
                ingress_rx,
                self.service.clone(),
                self.root.clone(),
                faults.clone(),
                self.scope.clone(),
            )
            .instrument(self.span.clone()),
        ));

        let drain = {
            let root = self.root.clone();
            let scope = self.scope.clone();
            let api = api.clone();
            let faults = faults.clone();
            let mut ready = ready_rx;
            async move {
                // Start once every synchronous subscription of the tree exists
                // and the host has finished its own initialization dispatch.
                let gate = async {
                    root.started().await;
                    ready.wait_for(|ready| *ready).await.is_ok()
                };
                let open = tokio::select! {
                    _ = scope.cancelled() => false,
                    open = gate => open,
                };
                if !open {
                    return;
                }
                if let Err(e) = dispatch::drain(stream, api, scope).await {
                    faults.raise(e);
                }
            }
        };
        self.track(self.runtime.spawn(drain.instrument(self.span.clone())));

        info!(bridge = %self.id, "bridge attached to host store");

        let id = self.id;
        let inflight = self.service.inflight().clone();
        let scope = self.scope.clone();
        let order = Mutex::new(());
        Ok(Arc::new(move |action: Action| {
            // The host and the drain loop dispatch from different threads;
            // hold the order lock so ingress sees actions in reducer order.
            let entered = Intercepting::enter(id);
            let _order = entered
                .as_ref()
                .map(|_| order.lock().unwrap_or_else(PoisonError::into_inner));

            let result = next(action.clone())?;
            let snapshot = api.get_state();

            inflight.inc(1);
            if ingress_tx.send((action, snapshot)).is_err() {
                inflight.dec(1);
                if scope.is_cancelled() {
                    trace!("bridge is shut down, host action not forwarded");
                } else {
                    let err = TandemError::OfferFailed {
                        what: "action",
                        message: "ingress task is gone".into(),
                    };
                    if faults.raise(err.clone()) {
                        return Err(err.into());
                    }
                }
            }

            ready_tx.send_if_modified(|ready| !std::mem::replace(ready, true));
            Ok(result)
        }))
    }
}

impl<S> Drop for BridgeInner<S> {
    fn drop(&mut self) {
        self.scope.cancel();
        self.service.close();
    }
}

thread_local! {
    static INTERCEPTING: RefCell<SmallVec<[BridgeId; 2]>> = RefCell::new(SmallVec::new());
}

/// Marks this thread as inside one bridge's interceptor until dropped.
struct Intercepting(BridgeId);

impl Intercepting {
    /// `None` if this thread is already inside the interceptor, i.e. a
    /// middleware further down the chain dispatched re-entrantly.
    fn enter(id: BridgeId) -> Option<Self> {
        INTERCEPTING.with(|ids| {
            let mut ids = ids.borrow_mut();
            if ids.contains(&id) {
                return None;
            }
            ids.push(id);
            Some(Self(id))
        })
    }
}

impl Drop for Intercepting {
    fn drop(&mut self) {
        INTERCEPTING.with(|ids| ids.borrow_mut().retain(|id| *id != self.0));
    }
}

/// Marks the bridge faulted and cancels its scope: the tree, every fork and
/// worker, ingress, and the drain loop.
#[derive(Clone)]
struct Faults {
    id: BridgeId,
    status: Arc<watch::Sender<BridgeStatus>>,
    scope: CancellationToken,
}

impl Faults {
    /// Returns `true` if this call faulted the bridge.
    fn raise(&self, err: TandemError) -> bool {
        let raised = self.status.send_if_modified(|status| {
            if status.is_running() {
                *status = BridgeStatus::Faulted(err.clone());
                true
            } else {
                false
            }
        });
        if raised {
            error!(bridge = %self.id, error = %err, "bridge faulted, stopping process tree");
            self.scope.cancel();
        }
        raised
    }
}

/// Fault the bridge when the root fails or panics.
async fn watch_root(root: TaskHandle, faults: Faults) {
    let exit = root.join().await;
    if exit.is_failure() {
        faults.raise(TandemError::ProcessTreeFailed {
            process: root.name().to_string(),
            exit: exit.to_string(),
        });
    }
}

/// Apply intercepted host actions: publish the state snapshot, then offer the
/// action to the action channel, one action at a time in dispatch order.
///
/// Nothing is delivered before the root has been polled once, so actions
/// dispatched right after construction reach subscriptions the tree makes on
/// startup.
async fn ingress<S: State>(
    mut rx: mpsc::UnboundedReceiver<(Action, S)>,
    service: CoordinationService<S>,
    root: TaskHandle,
    faults: Faults,
    scope: CancellationToken,
) {
    let open = tokio::select! {
        _ = scope.cancelled() => false,
        _ = root.started() => true,
    };

    if open {
        forward(&mut rx, &service, &faults, &scope).await;
    }

    rx.close();
    while rx.try_recv().is_ok() {
        service.inflight().dec(1);
    }
}

async fn forward<S: State>(
    rx: &mut mpsc::UnboundedReceiver<(Action, S)>,
    service: &CoordinationService<S>,
    faults: &Faults,
    scope: &CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            item = rx.recv() => item,
        };
        let Some((action, snapshot)) = item else { return };
        let _done = InflightGuard::adopt(service.inflight().clone(), 1);

        service.state().set(snapshot);
        trace!(action_type = %action, "forwarding host action");
        if let Err(e) = service.action().offer(action).await {
            if !scope.is_cancelled() {
                faults.raise(TandemError::OfferFailed {
                    what: "action",
                    message: e.to_string(),
                });
            }
            return;
        }
    }
}

/// The installable middleware half of a [`Bridge`].
pub struct BridgeMiddleware<S> {
    inner: Arc<BridgeInner<S>>,
}

impl<S: State> Middleware<S> for BridgeMiddleware<S> {
    fn wrap(&self, api: Arc<dyn MiddlewareApi<S>>, next: Next) -> anyhow::Result<Next> {
        Ok(self.inner.attach(api, next)?)
    }
}

impl<S> std::fmt::Debug for BridgeMiddleware<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMiddleware")
            .field("bridge", &self.inner.id)
            .finish()
    }
}
