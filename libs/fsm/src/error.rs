//! State machine errors.

use thiserror::Error;

/// Failure reported by a transition hook.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why an event could not be applied.
///
/// None of these are retryable: the event is a protocol error for the
/// current state, and the machine's state is unchanged in every case.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError<S, T> {
    /// No arc for `(state, event)`.
    #[error("invalid event {event:?} at state {state:?}")]
    InvalidTransition { state: S, event: T },

    /// The transition hook failed.
    #[error("hook for {event:?} at state {state:?} failed: {source}")]
    Hook {
        state: S,
        event: T,
        #[source]
        source: HookError,
    },

    /// A choice hook picked a state outside the arc's declared targets.
    #[error("hook for {event:?} at state {state:?} chose undeclared target {target:?}")]
    InvalidTarget { state: S, event: T, target: S },
}

impl<S: Copy, T: Copy> TransitionError<S, T> {
    /// State the machine was (and still is) in.
    pub fn state(&self) -> S {
        match self {
            TransitionError::InvalidTransition { state, .. }
            | TransitionError::Hook { state, .. }
            | TransitionError::InvalidTarget { state, .. } => *state,
        }
    }

    /// Tag of the rejected event.
    pub fn event(&self) -> T {
        match self {
            TransitionError::InvalidTransition { event, .. }
            | TransitionError::Hook { event, .. }
            | TransitionError::InvalidTarget { event, .. } => *event,
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, TransitionError::InvalidTransition { .. })
    }
}
