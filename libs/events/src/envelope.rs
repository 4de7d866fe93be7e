//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use rm_id::{AppId, AttemptId, ContainerId, EventId};
use serde::{Deserialize, Serialize};

use crate::{AppEvent, AttemptEvent, ContainerEvent, EntityId, EventError, EventPayload};

/// An immutable event addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Process-wide post order.
    pub event_id: EventId,

    /// When the event was posted.
    pub occurred_at: DateTime<Utc>,

    /// The entity whose state machine receives the event.
    pub target: EntityId,

    /// Event-specific payload; its kind always matches `target`.
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Wraps a payload, rejecting a payload whose kind differs from the target.
    pub fn new(
        event_id: EventId,
        target: EntityId,
        payload: EventPayload,
    ) -> Result<Self, EventError> {
        if target.kind() != payload.kind() {
            return Err(EventError::TargetMismatch {
                target: target.kind(),
                payload: payload.kind(),
            });
        }

        Ok(Self {
            event_id,
            occurred_at: Utc::now(),
            target,
            payload,
        })
    }

    pub fn for_app(event_id: EventId, app_id: AppId, event: AppEvent) -> Self {
        Self::unchecked(event_id, EntityId::App(app_id), EventPayload::App(event))
    }

    pub fn for_attempt(event_id: EventId, attempt_id: AttemptId, event: AttemptEvent) -> Self {
        Self::unchecked(
            event_id,
            EntityId::Attempt(attempt_id),
            EventPayload::Attempt(event),
        )
    }

    pub fn for_container(
        event_id: EventId,
        container_id: ContainerId,
        event: ContainerEvent,
    ) -> Self {
        Self::unchecked(
            event_id,
            EntityId::Container(container_id),
            EventPayload::Container(event),
        )
    }

    fn unchecked(event_id: EventId, target: EntityId, payload: EventPayload) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            target,
            payload,
        }
    }

    /// Canonical tag name of the payload.
    pub fn event_type(&self) -> &'static str {
        self.payload.type_name()
    }
}
