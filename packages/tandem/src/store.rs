//! Host store boundary and a reference reducer store.
//!
//! The bridge only needs [`MiddlewareApi`] from its host: a way to read the
//! current state and a way to dispatch. [`Middleware`] is the Rust shape of
//! `(api) => (next) => (action) => result`.
//!
//! [`Store`] is a small synchronous reducer store with a middleware chain. It
//! dispatches its initialization action through the chain, so installed
//! middleware (including the bridge) observes it.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::debug;

use crate::core::Action;
use crate::state::State;

/// What a dispatch returns to its caller.
///
/// The base store returns the dispatched action as JSON; upstream middleware
/// may return anything.
pub type DispatchResult = Result<Value>;

/// The next dispatch function in a middleware chain.
pub type Next = Arc<dyn Fn(Action) -> DispatchResult + Send + Sync>;

/// A reducer: the next state from the current state and an action.
pub type Reducer<S> = Arc<dyn Fn(&S, &Action) -> Result<S> + Send + Sync>;

/// The host calls a middleware may make.
pub trait MiddlewareApi<S>: Send + Sync {
    /// The host's current state.
    fn get_state(&self) -> S;

    /// Dispatch through the host's full middleware chain.
    fn dispatch(&self, action: Action) -> DispatchResult;
}

/// A host middleware.
pub trait Middleware<S>: Send + Sync {
    /// Wrap `next`, producing this middleware's dispatch function.
    fn wrap(&self, api: Arc<dyn MiddlewareApi<S>>, next: Next) -> Result<Next>;
}

impl<S, F> Middleware<S> for F
where
    F: Fn(Arc<dyn MiddlewareApi<S>>, Next) -> Result<Next> + Send + Sync,
{
    fn wrap(&self, api: Arc<dyn MiddlewareApi<S>>, next: Next) -> Result<Next> {
        self(api, next)
    }
}

struct StoreInner<S> {
    state: Mutex<S>,
    reducer: Reducer<S>,
    dispatch: OnceLock<Next>,
}

impl<S: State> StoreInner<S> {
    fn state(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, action: Action) -> DispatchResult {
        let dispatch = self.dispatch.get().ok_or_else(|| {
            anyhow!(
                "dispatching while constructing the middleware chain is not allowed; \
                 other middleware would not be applied to this dispatch"
            )
        })?;
        dispatch(action)
    }

    fn reduce(&self, action: Action) -> DispatchResult {
        let mut state = self.state();
        let next = (self.reducer)(&state, &action)?;
        *state = next;
        drop(state);
        Ok(Value::from(action))
    }
}

/// A synchronous reducer store with a middleware chain.
///
/// # Example
///
/// ```ignore
/// let store = Store::builder(reducer)
///     .middleware(bridge.middleware())
///     .build()?;
///
/// store.dispatch(Action::new("FIRE_1"))?;
/// ```
pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: State> Store<S> {
    /// Start building a store around `reducer`.
    pub fn builder<R>(reducer: R) -> StoreBuilder<S>
    where
        R: Fn(&S, &Action) -> Result<S> + Send + Sync + 'static,
    {
        StoreBuilder {
            reducer: Arc::new(reducer),
            middleware: Vec::new(),
            preloaded: None,
        }
    }

    /// A store without middleware.
    pub fn new<R>(reducer: R) -> Result<Self>
    where
        R: Fn(&S, &Action) -> Result<S> + Send + Sync + 'static,
    {
        Self::builder(reducer).build()
    }

    /// Dispatch an action through the middleware chain.
    pub fn dispatch(&self, action: Action) -> DispatchResult {
        self.inner.dispatch(action)
    }

    /// Dispatch a JSON value, rejecting values that are not actions.
    pub fn dispatch_value(&self, value: Value) -> DispatchResult {
        self.dispatch(Action::try_from(value)?)
    }

    /// The current state.
    pub fn get_state(&self) -> S {
        self.inner.state().clone()
    }

    /// The api handed to middleware.
    pub fn api(&self) -> Arc<dyn MiddlewareApi<S>> {
        Arc::new(StoreApi {
            inner: Arc::downgrade(&self.inner),
        })
    }
}

impl<S> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("ready", &self.inner.dispatch.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder<S> {
    reducer: Reducer<S>,
    middleware: Vec<Arc<dyn Middleware<S>>>,
    preloaded: Option<S>,
}

impl<S: State> StoreBuilder<S> {
    /// Append a middleware. The first middleware added is the outermost.
    pub fn middleware(mut self, middleware: impl Middleware<S> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Start from `state` instead of `S::default()`.
    pub fn preloaded_state(mut self, state: S) -> Self {
        self.preloaded = Some(state);
        self
    }

    /// Compose the chain and dispatch the initialization action through it.
    pub fn build(self) -> Result<Store<S>> {
        let inner = Arc::new(StoreInner {
            state: Mutex::new(self.preloaded.unwrap_or_default()),
            reducer: self.reducer,
            dispatch: OnceLock::new(),
        });
        let store = Store { inner };

        let base: Next = {
            let inner = Arc::downgrade(&store.inner);
            Arc::new(move |action: Action| match inner.upgrade() {
                Some(inner) => inner.reduce(action),
                None => Err(anyhow!("store has been dropped")),
            })
        };

        let api = store.api();
        let mut dispatch = base;
        for middleware in self.middleware.iter().rev() {
            dispatch = middleware.wrap(api.clone(), dispatch)?;
        }

        if store.inner.dispatch.set(dispatch).is_err() {
            return Err(anyhow!("store dispatch was initialized twice"));
        }

        debug!(middleware = self.middleware.len(), "store built");
        store.dispatch(Action::init())?;
        Ok(store)
    }
}

/// Weak handle so the chain does not keep its own store alive.
struct StoreApi<S> {
    inner: Weak<StoreInner<S>>,
}

impl<S: State> MiddlewareApi<S> for StoreApi<S> {
    fn get_state(&self) -> S {
        self.inner
            .upgrade()
            .map(|inner| inner.state().clone())
            .unwrap_or_default()
    }

    fn dispatch(&self, action: Action) -> DispatchResult {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatch(action),
            None => Err(anyhow!("store has been dropped")),
        }
    }
}
