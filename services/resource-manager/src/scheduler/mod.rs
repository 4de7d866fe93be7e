//! Scheduling and preemption.
//!
//! The scheduler task owns the [`Ledger`] and every outstanding ask. It is
//! driven by its inbox (node changes, asks, container starts and releases)
//! and by a periodic allocation pass. Its decisions leave as events posted
//! to attempts and containers.

mod engine;
mod ledger;
mod policy;
mod preemption;
mod worker;

pub use engine::{Scheduler, SchedulerAction, SchedulerSettings};
pub use ledger::{HeartbeatError, Holding, Ledger, LedgerError, NodeEntry, QueueEntry};
pub use policy::{
    plan_allocations, AllocationPlan, Grant, OrderingPolicy, ParsePolicyError, PendingAsk,
    ResourceAsk, VictimOrder,
};
pub use preemption::{plan_preemption, Candidate, Victim};
pub use worker::SchedulerWorker;

use rm_events::Resource;
use rm_id::{AttemptId, ContainerId, NodeId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// The scheduler task is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scheduler stopped")]
pub struct SchedulerStopped;

/// Scheduler inbox messages.
#[derive(Debug)]
pub enum SchedulerMessage {
    NodeAdded {
        node_id: NodeId,
        capacity: Resource,
        reply: oneshot::Sender<Result<(), LedgerError>>,
    },
    NodeRemoved {
        node_id: NodeId,
        reason: String,
    },
    NodeHeartbeat {
        node_id: NodeId,
        seq: u64,
        reply: oneshot::Sender<Result<(), HeartbeatError>>,
    },
    AttemptAdded {
        attempt_id: AttemptId,
        queue: String,
        submitted_seq: u64,
    },
    AttemptRemoved {
        attempt_id: AttemptId,
    },
    Ask {
        attempt_id: AttemptId,
        asks: Vec<ResourceAsk>,
        is_am: bool,
    },
    ContainerStarted {
        container_id: ContainerId,
    },
    ContainerReleased {
        container_id: ContainerId,
    },
    Snapshot {
        reply: oneshot::Sender<Ledger>,
    },
    /// Run an allocation pass now.
    Schedule,
}

/// Cloneable sender into the scheduler inbox.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    /// Creates a handle and the inbox a [`SchedulerWorker`] will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SchedulerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub async fn add_node(
        &self,
        node_id: NodeId,
        capacity: Resource,
    ) -> Result<Result<(), LedgerError>, SchedulerStopped> {
        self.request(|reply| SchedulerMessage::NodeAdded {
            node_id,
            capacity,
            reply,
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        node_id: NodeId,
        seq: u64,
    ) -> Result<Result<(), HeartbeatError>, SchedulerStopped> {
        self.request(|reply| SchedulerMessage::NodeHeartbeat {
            node_id,
            seq,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Ledger, SchedulerStopped> {
        self.request(|reply| SchedulerMessage::Snapshot { reply }).await
    }

    pub fn remove_node(&self, node_id: NodeId, reason: impl Into<String>) {
        self.send(SchedulerMessage::NodeRemoved {
            node_id,
            reason: reason.into(),
        });
    }

    pub fn attempt_added(&self, attempt_id: AttemptId, queue: String, submitted_seq: u64) {
        self.send(SchedulerMessage::AttemptAdded {
            attempt_id,
            queue,
            submitted_seq,
        });
    }

    pub fn attempt_removed(&self, attempt_id: AttemptId) {
        self.send(SchedulerMessage::AttemptRemoved { attempt_id });
    }

    /// Asks for the application master's container.
    pub fn am_ask(&self, attempt_id: AttemptId, resource: Resource) {
        self.send(SchedulerMessage::Ask {
            attempt_id,
            asks: vec![ResourceAsk::new(resource, 1).with_priority(0)],
            is_am: true,
        });
    }

    pub fn ask(&self, attempt_id: AttemptId, asks: Vec<ResourceAsk>) {
        if asks.is_empty() {
            return;
        }
        self.send(SchedulerMessage::Ask {
            attempt_id,
            asks,
            is_am: false,
        });
    }

    pub fn container_started(&self, container_id: ContainerId) {
        self.send(SchedulerMessage::ContainerStarted { container_id });
    }

    pub fn container_released(&self, container_id: ContainerId) {
        self.send(SchedulerMessage::ContainerReleased { container_id });
    }

    pub fn schedule(&self) {
        self.send(SchedulerMessage::Schedule);
    }

    fn send(&self, msg: SchedulerMessage) {
        if let Err(e) = self.tx.send(msg) {
            warn!(message = ?e.0, "Scheduler stopped, message dropped");
        }
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> SchedulerMessage,
    ) -> Result<R, SchedulerStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SchedulerStopped)?;
        rx.await.map_err(|_| SchedulerStopped)
    }
}
