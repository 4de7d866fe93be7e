//! Event dispatcher.
//!
//! Routes events to entity controllers with per-entity ordering:
//! - Entities are sharded across worker tasks by a deterministic hash of
//!   their id, so every event for one entity lands on the same shard
//! - Each shard exclusively owns its controllers and applies events one at
//!   a time, in post order
//! - Shards run concurrently with each other
//! - `post` never blocks and never fails because of what the handler does
//!
//! Controller registration travels on the entity's shard like any event,
//! so it is ordered before every later event for that entity.

mod board;
mod shard;

pub use board::StatusBoard;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rm_events::{
    AppEvent, AttemptEvent, ContainerEvent, EntityId, EventEnvelope, EventError, EventPayload,
};
use rm_id::{AppId, AttemptId, ContainerId, EventId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::EntityController;
use shard::{run_shard, Shard};

/// Errors returned when posting.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error("dispatcher stopped")]
    Stopped,
}

/// Messages understood by a shard.
pub(crate) enum ShardMessage {
    Register(Box<dyn EntityController>),
    Deliver(EventEnvelope),
    /// Acknowledged once everything queued before it has been processed.
    Flush(oneshot::Sender<()>),
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle for posting events and registering controllers.
#[derive(Clone)]
pub struct DispatcherHandle {
    shards: Arc<[mpsc::UnboundedSender<ShardMessage>]>,
    next_event_id: Arc<AtomicU64>,
    board: StatusBoard,
}

impl DispatcherHandle {
    /// Posts an event. Returns as soon as the event is queued.
    pub fn post(&self, target: EntityId, payload: EventPayload) -> Result<EventId, DispatchError> {
        let event_id = self.next_event_id();
        let envelope = EventEnvelope::new(event_id, target, payload)?;
        self.send(target, ShardMessage::Deliver(envelope))?;
        Ok(event_id)
    }

    /// Posts to an application. A stopped dispatcher is logged, not returned.
    pub fn post_app(&self, app_id: AppId, event: AppEvent) -> EventId {
        let envelope = EventEnvelope::for_app(self.next_event_id(), app_id, event);
        self.deliver(envelope)
    }

    pub fn post_attempt(&self, attempt_id: AttemptId, event: AttemptEvent) -> EventId {
        let envelope = EventEnvelope::for_attempt(self.next_event_id(), attempt_id, event);
        self.deliver(envelope)
    }

    pub fn post_container(&self, container_id: ContainerId, event: ContainerEvent) -> EventId {
        let envelope = EventEnvelope::for_container(self.next_event_id(), container_id, event);
        self.deliver(envelope)
    }

    /// Hands a controller to its shard. Events posted afterwards for the
    /// same entity are applied after registration.
    pub fn register(&self, controller: Box<dyn EntityController>) {
        let entity = controller.entity_id();
        if self.send(entity, ShardMessage::Register(controller)).is_err() {
            warn!(entity = %entity, "Dispatcher stopped, controller dropped");
        }
    }

    /// Waits until every message queued before this call has been
    /// processed by every shard.
    pub async fn flush(&self) {
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            let (tx, rx) = oneshot::channel();
            if shard.send(ShardMessage::Flush(tx)).is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Number of events posted so far.
    pub fn posted(&self) -> u64 {
        self.next_event_id.load(Ordering::SeqCst)
    }

    fn next_event_id(&self) -> EventId {
        EventId::new(self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn deliver(&self, envelope: EventEnvelope) -> EventId {
        let event_id = envelope.event_id;
        let target = envelope.target;
        let event_type = envelope.event_type();
        if self.send(target, ShardMessage::Deliver(envelope)).is_err() {
            warn!(entity = %target, event_type, "Dispatcher stopped, event dropped");
        }
        event_id
    }

    fn send(&self, entity: EntityId, msg: ShardMessage) -> Result<(), DispatchError> {
        self.shards[self.shard_of(&entity)]
            .send(msg)
            .map_err(|_| DispatchError::Stopped)
    }

    fn shard_of(&self, entity: &EntityId) -> usize {
        let mut hasher = DefaultHasher::new();
        entity.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// A single-shard handle whose messages land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn capture() -> (Self, mpsc::UnboundedReceiver<ShardMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            shards: Arc::from(vec![tx]),
            next_event_id: Arc::new(AtomicU64::new(0)),
            board: StatusBoard::new(16),
        };
        (handle, rx)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owns the shard tasks.
pub struct Dispatcher {
    handle: DispatcherHandle,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns `workers` shard tasks. Each keeps up to `retention` terminal
    /// controllers around to absorb late duplicates.
    pub fn start(workers: usize, retention: usize) -> Self {
        let workers = workers.max(1);
        let board = StatusBoard::new(retention);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let shard = Shard::new(index, retention, board.clone());
            tasks.push(tokio::spawn(run_shard(shard, rx, shutdown_rx.clone())));
            senders.push(tx);
        }

        info!(workers, retention, "Started dispatcher");

        Self {
            handle: DispatcherHandle {
                shards: Arc::from(senders),
                next_event_id: Arc::new(AtomicU64::new(0)),
                board,
            },
            shutdown_tx,
            workers: tasks,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Stops every shard after it drains what is already queued.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher shard task failed");
            }
        }
        debug!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_events::{AppState, EntityKind, EntityState};
    use rm_fsm::Outcome;

    use crate::controller::{ApplyError, EntityStatus};

    /// Records every delivered event id.
    struct Recorder {
        id: EntityId,
        seen: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    impl EntityController for Recorder {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError> {
            self.seen.lock().unwrap().push(envelope.event_id.value());
            Ok(Outcome::Ignored {
                state: EntityState::App(AppState::New),
            })
        }

        fn status(&self) -> EntityStatus {
            EntityStatus {
                state: EntityState::App(AppState::New),
                diagnostics: Vec::new(),
            }
        }
    }

    #[test]
    fn test_shard_of_is_stable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle {
            shards: Arc::from(vec![tx.clone(), tx.clone(), tx]),
            next_event_id: Arc::new(AtomicU64::new(0)),
            board: StatusBoard::new(4),
        };
        let entity = EntityId::App(AppId::new());
        let first = handle.shard_of(&entity);
        for _ in 0..10 {
            assert_eq!(handle.shard_of(&entity), first);
        }
        assert!(first < 3);
    }

    #[test]
    fn test_post_rejects_mismatched_payload() {
        let (handle, _rx) = DispatcherHandle::capture();
        let err = handle
            .post(
                EntityId::App(AppId::new()),
                EventPayload::Container(ContainerEvent::Localized),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Event(EventError::TargetMismatch {
                target: EntityKind::App,
                payload: EntityKind::Container,
            })
        ));
    }

    #[tokio::test]
    async fn test_events_delivered_in_post_order() {
        let dispatcher = Dispatcher::start(3, 8);
        let handle = dispatcher.handle();
        let app_id = AppId::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        handle.register(Box::new(Recorder {
            id: EntityId::App(app_id),
            seen: Arc::clone(&seen),
        }));
        let posted: Vec<u64> = (0..50)
            .map(|_| handle.post_app(app_id, AppEvent::Start).value())
            .collect();

        handle.flush().await;
        assert_eq!(*seen.lock().unwrap(), posted);
        assert_eq!(
            handle.board().get_state(&EntityId::App(app_id)),
            Some(EntityState::App(AppState::New))
        );

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_after_shutdown_is_stopped() {
        let dispatcher = Dispatcher::start(1, 8);
        let handle = dispatcher.handle();
        dispatcher.shutdown().await;

        let err = handle
            .post(EntityId::App(AppId::new()), EventPayload::App(AppEvent::Start))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Stopped));
    }
}
