//! # Tandem
//!
//! A coordination bridge that runs concurrent effect processes in tandem with
//! a synchronous reducer store.
//!
//! ## Core Concepts
//!
//! The host store stays synchronous and authoritative:
//! - [`Store`] applies actions with a reducer, through a middleware chain
//! - [`Process`]es are long-running async units that observe dispatched
//!   actions, read state, and dispatch new actions
//! - a [`Bridge`] owns one process tree and attaches it to one store as
//!   middleware
//!
//! ## Architecture
//!
//! ```text
//! store.dispatch(action)
//!     │
//!     ▼
//! BridgeMiddleware ──► next(action) ──► reducer        (synchronous)
//!     │
//!     ▼ ingress
//! StateCell.set(snapshot), ActionChannel.offer(action) (asynchronous)
//!     │
//!     ├─► Process A.take(..) ─► put(..) ──┐
//!     │                                   │
//!     └─► Process B.take_every(..) ───────┤
//!                                         ▼
//!                                  DispatchChannel
//!                                         │
//!                                         ▼ drain loop
//!                                  store.dispatch(..)
//! ```
//!
//! ## Guarantees
//!
//! - **Reducer first**: the host reducer applies an action before any process
//!   observes it
//! - **Ordered delivery**: every subscriber sees host actions in the order
//!   the reducer applied them, with no drops unless a dropping or sliding
//!   backing is configured
//! - **Program order for puts**: one process's sequential puts reach the host
//!   in order; puts from different processes may interleave
//! - **No re-entrant dispatch**: process actions reach the host from a
//!   single drain loop, never from inside the originating dispatch
//! - **Let it crash**: a failure or panic that reaches the root of the tree
//!   ends the tree and faults the bridge; [`Process::recover`] draws an
//!   explicit boundary
//!
//! ## Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use tandem::{Action, Bridge, Process, Store};
//!
//! let fire_1 = Process::make("fire-1", |actions, _state| {
//!     actions
//!         .filter(|a| futures::future::ready(a.is("FIRE_1")))
//!         .map(|_| Action::new("ACTION_1"))
//! });
//!
//! let fetch = Process::from_fn("fetch", |ctx| async move {
//!     ctx.take_every(tandem::of_type("FETCH"), (), |action, ()| async move {
//!         tracing::info!(payload = ?action.payload(), "fetching");
//!         Ok(())
//!     });
//!     ctx.interrupted().await;
//!     Ok(())
//! });
//!
//! let bridge = Bridge::new(Process::all("root", [fire_1, fetch]))?;
//! let store = Store::builder(reducer)
//!     .middleware(bridge.middleware())
//!     .build()?;
//!
//! store.dispatch(Action::new("FIRE_1"))?;
//!
//! bridge.shutdown().await;
//! ```
//!
//! ## What This Is Not
//!
//! Tandem is **not**:
//! - A scheduler or a streaming runtime (it composes tokio)
//! - Durable (actions live in memory only)
//! - A replacement for the host store
//!
//! Tandem **is**:
//! > A supervised process tree that hears every action after the reducer
//! > does, and speaks back through one ordered drain loop.

// Core modules
mod action;
mod bridge;
mod broadcast;
mod config;
mod core;
mod dispatch;
mod error;
mod inflight;
mod operators;
mod process;
mod queue;
mod service;
mod state;
mod store;
mod supervisor;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;


// Re-export core types
pub use crate::core::{any_action, is_action, of_type, of_types, Action, ActionType, BridgeId, Take};

// Re-export error types
pub use crate::error::TandemError;

// Re-export configuration
pub use crate::config::{Backing, BridgeOptions};

// Re-export channels
pub use crate::action::{ActionChannel, ActionStream};
pub use crate::broadcast::{Broadcast, Subscription};
pub use crate::dispatch::{DispatchChannel, DispatchStream};
pub use crate::inflight::{Inflight, InflightGuard};
pub use crate::queue::{Offered, Queue, TakeSource};
pub use crate::service::CoordinationService;
pub use crate::state::{State, StateCell};

// Re-export host store
pub use crate::store::{DispatchResult, Middleware, MiddlewareApi, Next, Reducer, Store, StoreBuilder};

// Re-export processes and operators
pub use crate::operators::take_from;
pub use crate::process::{Process, ProcessContext, ProcessFuture};
pub use crate::supervisor::{Exit, TaskHandle};

// Re-export bridge
pub use crate::bridge::{Bridge, BridgeBuilder, BridgeMiddleware, BridgeStatus};

// Re-export async_trait for TakeSource implementations
pub use async_trait::async_trait;
