//! Dispatcher shard loop.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use rm_events::{EntityId, EventEnvelope};
use rm_fsm::Outcome;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{ShardMessage, StatusBoard};
use crate::controller::EntityController;

/// Controllers owned by one shard task.
pub(crate) struct Shard {
    index: usize,
    controllers: HashMap<EntityId, Box<dyn EntityController>>,
    /// Terminal entities, oldest first.
    completed: VecDeque<EntityId>,
    retention: usize,
    board: StatusBoard,
    processed: u64,
}

impl Shard {
    pub(crate) fn new(index: usize, retention: usize, board: StatusBoard) -> Self {
        Self {
            index,
            controllers: HashMap::new(),
            completed: VecDeque::new(),
            retention,
            board,
            processed: 0,
        }
    }

    fn process(&mut self, msg: ShardMessage) {
        match msg {
            ShardMessage::Register(controller) => self.register(controller),
            ShardMessage::Deliver(envelope) => self.deliver(envelope),
            ShardMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn register(&mut self, controller: Box<dyn EntityController>) {
        let entity = controller.entity_id();
        if self.controllers.contains_key(&entity) {
            warn!(shard = self.index, entity = %entity, "Entity already registered, keeping existing controller");
            return;
        }

        self.board.update(entity, controller.status());
        self.controllers.insert(entity, controller);
        debug!(shard = self.index, entity = %entity, "Registered controller");
    }

    fn deliver(&mut self, envelope: EventEnvelope) {
        self.processed += 1;
        let entity = envelope.target;
        let event_type = envelope.event_type();

        let Some(controller) = self.controllers.get_mut(&entity) else {
            debug!(shard = self.index, entity = %entity, event_type, "No controller for entity, dropping event");
            return;
        };

        let was_terminal = controller.is_terminal();
        let result = catch_unwind(AssertUnwindSafe(|| controller.handle(&envelope)));

        match result {
            Ok(Ok(Outcome::Transitioned { from, to })) => {
                debug!(
                    shard = self.index,
                    entity = %entity,
                    event_type,
                    from = %from,
                    to = %to,
                    "Applied event"
                );
            }
            Ok(Ok(Outcome::Ignored { state })) => {
                debug!(shard = self.index, entity = %entity, event_type, state = %state, "Ignored event");
            }
            Ok(Err(e)) if e.is_invalid_transition() => {
                warn!(shard = self.index, entity = %entity, event_type, error = %e, "Invalid transition, dropping event");
                return;
            }
            Ok(Err(e)) => {
                error!(shard = self.index, entity = %entity, event_type, error = %e, "Failed to apply event");
            }
            Err(_) => {
                error!(shard = self.index, entity = %entity, event_type, "Controller panicked while applying event");
            }
        }

        let status = controller.status();
        let now_terminal = status.state.is_terminal();
        self.board.update(entity, status);

        if now_terminal && !was_terminal {
            self.retire(entity);
        }
    }

    /// Keeps the most recent terminal controllers; older ones are dropped.
    fn retire(&mut self, entity: EntityId) {
        self.completed.push_back(entity);
        while self.completed.len() > self.retention {
            if let Some(evicted) = self.completed.pop_front() {
                self.controllers.remove(&evicted);
                debug!(shard = self.index, entity = %evicted, "Evicted completed controller");
            }
        }
    }
}

/// Runs a shard until shutdown is signaled, then drains what is queued.
pub(crate) async fn run_shard(
    mut shard: Shard,
    mut rx: mpsc::UnboundedReceiver<ShardMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(shard = shard.index, "Shard started");

    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(shard = shard.index, "Shard received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => shard.process(msg),
                    None => {
                        debug!(shard = shard.index, "Shard inbox closed");
                        break;
                    }
                }
            }
        }
    }

    // Drain what was posted before shutdown; later posts fail at the sender.
    rx.close();
    while let Some(msg) = rx.recv().await {
        shard.process(msg);
    }

    info!(
        shard = shard.index,
        events_processed = shard.processed,
        controllers = shard.controllers.len(),
        "Shard stopped"
    );
}
