//! Structured error types for tandem.
//!
//! `TandemError` provides pattern-matchable errors for the bridge itself.
//! Processes use `anyhow::Result` for their own failures; a `TandemError`
//! returned from an operator (for example [`TandemError::TakeExhausted`])
//! travels through `?` like any other error and can be recovered with
//! `downcast_ref`.
//!
//! # Example
//!
//! ```ignore
//! use tandem::TandemError;
//!
//! match ctx.take_required(of_type("REQUEST")).await {
//!     Ok(action) => handle(action),
//!     Err(TandemError::TakeExhausted) => return Ok(()),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the bridge, its channels, and its operators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TandemError {
    /// A JSON value did not have the shape of an action.
    #[error("not an action: {reason}")]
    NotAnAction {
        /// What was wrong with the value.
        reason: String,
    },

    /// Construction options failed validation.
    #[error("invalid bridge options: {message}")]
    InvalidOptions {
        /// Which option was rejected and why.
        message: String,
    },

    /// No tokio runtime was supplied and none is running.
    #[error("no tokio runtime available; build the bridge inside a runtime or pass a handle")]
    NoRuntime,

    /// The bridge middleware was installed into a second store.
    #[error("bridge middleware is already attached to a store")]
    AlreadyAttached,

    /// The dispatch stream was requested a second time.
    #[error("dispatch stream already consumed by a drain loop")]
    DrainAlreadyStarted,

    /// A channel owned by the bridge has been shut down.
    #[error("{channel} channel is closed")]
    ChannelClosed {
        /// Which channel.
        channel: &'static str,
    },

    /// The action stream ended before a required action arrived.
    #[error("action stream ended before a matching action arrived")]
    TakeExhausted,

    /// Invoking the host dispatch failed inside the drain loop.
    #[error("host dispatch failed for {action_type}: {message}")]
    DispatchFailed {
        /// Type of the action being dispatched.
        action_type: String,
        /// The underlying error message.
        message: String,
    },

    /// Offering an intercepted action or state snapshot failed.
    #[error("failed to offer {what}: {message}")]
    OfferFailed {
        /// "action" or "state".
        what: &'static str,
        /// The underlying error message.
        message: String,
    },

    /// A producer signalled failure on the dispatch channel.
    #[error("process output failed: {message}")]
    ProducerFailed {
        /// The failure carried by the take.
        message: String,
    },

    /// The root process failed or panicked.
    #[error("process tree {process} ended with {exit}")]
    ProcessTreeFailed {
        /// Name of the root process.
        process: String,
        /// The rendered exit, e.g. `failure: ...` or `defect: ...`.
        exit: String,
    },

    /// Timeout waiting for the bridge.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },
}

impl TandemError {
    /// Whether this error means the bridge can no longer deliver
    /// process-originated actions.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TandemError::DispatchFailed { .. }
                | TandemError::OfferFailed { .. }
                | TandemError::ProducerFailed { .. }
                | TandemError::ProcessTreeFailed { .. }
        )
    }
}
