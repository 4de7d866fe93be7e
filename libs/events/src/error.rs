//! Error types for event handling.

use thiserror::Error;

use crate::EntityKind;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type name is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload kind does not match the target entity kind.
    #[error("payload for {payload} cannot target {target} entity")]
    TargetMismatch {
        target: EntityKind,
        payload: EntityKind,
    },
}
