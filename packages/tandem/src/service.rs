//! The coordination service injected into every process.

use std::sync::Arc;

use crate::action::ActionChannel;
use crate::config::BridgeOptions;
use crate::core::BridgeId;
use crate::dispatch::DispatchChannel;
use crate::inflight::Inflight;
use crate::state::{State, StateCell};

/// The action channel, state cell, and dispatch channel of one bridge.
///
/// Built once per bridge before the middleware exists, then handed to every
/// process through its [`ProcessContext`](crate::ProcessContext). Cloning is
/// cheap and every clone refers to the same channels.
pub struct CoordinationService<S> {
    id: BridgeId,
    action: ActionChannel,
    state: StateCell<S>,
    dispatch: DispatchChannel,
    inflight: Arc<Inflight>,
}

impl<S> Clone for CoordinationService<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            action: self.action.clone(),
            state: self.state.clone(),
            dispatch: self.dispatch.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<S: State> CoordinationService<S> {
    /// Allocate the channels described by `options`.
    pub fn new(id: BridgeId, options: &BridgeOptions) -> Self {
        let inflight = Arc::new(Inflight::new());
        Self {
            id,
            action: ActionChannel::new(options, inflight.clone()),
            state: StateCell::new(options.replay),
            dispatch: DispatchChannel::new(inflight.clone()),
            inflight,
        }
    }
}

impl<S> CoordinationService<S> {
    /// The owning bridge.
    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Host-dispatched actions.
    pub fn action(&self) -> &ActionChannel {
        &self.action
    }

    /// The host state snapshot.
    pub fn state(&self) -> &StateCell<S> {
        &self.state
    }

    /// Actions on their way back into the host.
    pub fn dispatch(&self) -> &DispatchChannel {
        &self.dispatch
    }

    pub(crate) fn inflight(&self) -> &Arc<Inflight> {
        &self.inflight
    }

    /// Close the action channel and the state change stream.
    pub(crate) fn close(&self) {
        self.action.close();
        self.state.close();
    }
}

impl<S> std::fmt::Debug for CoordinationService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationService")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("dispatch", &self.dispatch)
            .field("inflight", &self.inflight)
            .finish()
    }
}
