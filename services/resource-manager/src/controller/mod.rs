//! Entity controllers.
//!
//! A controller owns one entity's state machine plus everything the entity
//! knows about itself. Controllers live inside a dispatcher shard and are
//! only ever touched by that shard's task, so they need no locking.
//!
//! Controllers reach collaborators through [`Services`]: cloned handles
//! (dispatcher, scheduler inbox, store, launcher, notification bus, AM
//! liveliness monitor) that never own other entities.

mod app;
mod attempt;
mod container;

pub use app::{AppController, AppSpec};
pub use attempt::{AttemptController, AttemptSpec};
pub use container::ContainerController;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rm_events::{
    AppEventType, AppState, AttemptEventType, AttemptState, ContainerEventType, ContainerState,
    EntityId, EntityKind, EntityState, EventEnvelope, EventPayload, Snapshot,
};
use rm_fsm::{Outcome, TransitionError};
use rm_id::AttemptId;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::dispatcher::DispatcherHandle;
use crate::launcher::ContainerLauncher;
use crate::monitor::LivelinessMonitor;
use crate::notify::NotificationBus;
use crate::scheduler::SchedulerHandle;
use crate::store::StateStore;

// =============================================================================
// Controller Trait
// =============================================================================

/// An entity driven by the dispatcher.
pub trait EntityController: Send + 'static {
    fn entity_id(&self) -> EntityId;

    /// Applies one event addressed to this entity.
    fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError>;

    /// Current state and diagnostics, for the status board.
    fn status(&self) -> EntityStatus;

    fn is_terminal(&self) -> bool {
        self.status().state.is_terminal()
    }
}

/// Queryable view of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStatus {
    pub state: EntityState,
    pub diagnostics: Vec<String>,
}

/// Why a controller rejected an event.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{entity} cannot handle a {payload} event")]
    WrongKind {
        entity: EntityId,
        payload: EntityKind,
    },

    #[error(transparent)]
    App(#[from] TransitionError<AppState, AppEventType>),

    #[error(transparent)]
    Attempt(#[from] TransitionError<AttemptState, AttemptEventType>),

    #[error(transparent)]
    Container(#[from] TransitionError<ContainerState, ContainerEventType>),
}

impl ApplyError {
    /// True when the event is a protocol error for the entity's state.
    pub fn is_invalid_transition(&self) -> bool {
        match self {
            ApplyError::WrongKind { .. } => false,
            ApplyError::App(e) => e.is_invalid_transition(),
            ApplyError::Attempt(e) => e.is_invalid_transition(),
            ApplyError::Container(e) => e.is_invalid_transition(),
        }
    }

    pub(crate) fn wrong_kind(entity: EntityId, payload: &EventPayload) -> Self {
        ApplyError::WrongKind {
            entity,
            payload: payload.kind(),
        }
    }
}

/// Lifts a per-kind outcome into the kind-agnostic one.
pub(crate) fn lift<S: Copy>(outcome: Outcome<S>, wrap: fn(S) -> EntityState) -> Outcome<EntityState> {
    match outcome {
        Outcome::Transitioned { from, to } => Outcome::Transitioned {
            from: wrap(from),
            to: wrap(to),
        },
        Outcome::Ignored { state } => Outcome::Ignored { state: wrap(state) },
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Settings controllers read at event time.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub diagnostics_cap: usize,
    pub attempt_failures_validity: Option<Duration>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            diagnostics_cap: 100,
            attempt_failures_validity: None,
        }
    }
}

/// Handles shared by every controller.
#[derive(Clone)]
pub struct Services {
    pub dispatcher: DispatcherHandle,
    pub scheduler: SchedulerHandle,
    pub store: Arc<dyn StateStore>,
    pub launcher: Arc<dyn ContainerLauncher>,
    pub notifications: NotificationBus,
    pub am_monitor: LivelinessMonitor<AttemptId>,
    pub settings: Arc<ControllerSettings>,
    pub saves: SaveQueue,
}

impl Services {
    /// Saves a snapshot in the background, then posts `on_saved` to the
    /// snapshot's entity.
    ///
    /// A store that keeps failing leaves the entity in its saving state;
    /// retrying is the store's business.
    pub(crate) fn persist(&self, snapshot: Snapshot, on_saved: Option<EventPayload>) {
        let store = Arc::clone(&self.store);
        let dispatcher = self.dispatcher.clone();
        let entity = snapshot.entity_id();

        self.saves.push(entity, async move {
            match store.save(entity, snapshot).await {
                Ok(()) => {
                    if let Some(payload) = on_saved {
                        if let Err(e) = dispatcher.post(entity, payload) {
                            warn!(entity = %entity, error = %e, "Failed to post save completion");
                        }
                    }
                }
                Err(e) => {
                    error!(entity = %entity, error = %e, "Failed to save snapshot");
                }
            }
        });
    }
}

/// Background saves chained per entity: a save starts only after the
/// entity's previous one has finished, so the store always ends up with the
/// latest snapshot even while a retrying store backs off.
#[derive(Clone, Default)]
pub struct SaveQueue {
    next: Arc<AtomicU64>,
    tails: Arc<Mutex<HashMap<EntityId, (u64, JoinHandle<()>)>>>,
}

impl SaveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push<F>(&self, entity: EntityId, save: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let queue = self.clone();

        let mut tails = self.tails();
        let previous = tails.remove(&entity);
        let handle = tokio::spawn(async move {
            if let Some((_, previous)) = previous {
                // a panicked save still releases the next one
                let _ = previous.await;
            }
            save.await;

            let mut tails = queue.tails();
            if matches!(tails.get(&entity), Some((latest, _)) if *latest == seq) {
                tails.remove(&entity);
            }
        });
        tails.insert(entity, (seq, handle));
    }

    /// Entities with a save still queued or running.
    pub fn in_flight(&self) -> usize {
        self.tails().len()
    }

    fn tails(&self) -> MutexGuard<'_, HashMap<EntityId, (u64, JoinHandle<()>)>> {
        self.tails.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Services wired to capture channels instead of running tasks: every
/// dispatcher message lands in the first receiver, every scheduler message
/// in the second. The launcher is manual.
#[cfg(test)]
pub(crate) fn test_services() -> (
    Services,
    tokio::sync::mpsc::UnboundedReceiver<crate::dispatcher::ShardMessage>,
    tokio::sync::mpsc::UnboundedReceiver<crate::scheduler::SchedulerMessage>,
) {
    let (dispatcher, shard_rx) = DispatcherHandle::capture();
    let (scheduler, scheduler_rx) = SchedulerHandle::channel();
    let services = Services {
        launcher: Arc::new(crate::launcher::SimulatedLauncher::manual(dispatcher.clone())),
        dispatcher,
        scheduler,
        store: Arc::new(crate::store::MemoryStateStore::new()),
        notifications: NotificationBus::new(16),
        am_monitor: LivelinessMonitor::new("am", Duration::from_secs(600)),
        settings: Arc::new(ControllerSettings::default()),
        saves: SaveQueue::new(),
    };
    (services, shard_rx, scheduler_rx)
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Append-only diagnostics log; the oldest entries fall off past the cap.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    entries: VecDeque<String>,
    cap: usize,
}

impl Diagnostics {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn from_vec(entries: Vec<String>, cap: usize) -> Self {
        let mut diagnostics = Self::new(cap);
        for entry in entries {
            diagnostics.push(entry);
        }
        diagnostics
    }

    /// Appends an entry. Empty strings are skipped.
    pub fn push(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        if entry.is_empty() {
            return;
        }
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// All entries on one line each.
    pub fn joined(&self) -> String {
        self.to_vec().join("\n")
    }
}
