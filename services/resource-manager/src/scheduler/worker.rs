//! Scheduler background worker.
//!
//! Owns the [`Scheduler`] and runs it on a periodic interval and on every
//! inbox message that can change what fits.

use std::time::Duration;

use rm_events::{AttemptEvent, ContainerEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

use super::engine::{Scheduler, SchedulerAction};
use super::SchedulerMessage;
use crate::controller::{ContainerController, Services};

/// Scheduler worker that drains the inbox and runs allocation passes.
pub struct SchedulerWorker {
    scheduler: Scheduler,
    rx: mpsc::UnboundedReceiver<SchedulerMessage>,
    interval: Duration,
    services: Services,
}

impl SchedulerWorker {
    pub fn new(
        scheduler: Scheduler,
        rx: mpsc::UnboundedReceiver<SchedulerMessage>,
        interval: Duration,
        services: Services,
    ) -> Self {
        Self {
            scheduler,
            rx,
            interval,
            services,
        }
    }

    /// Run the scheduler worker until shutdown is signaled or every handle
    /// is dropped.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }

                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        info!("Scheduler inbox closed");
                        break;
                    };
                    if self.handle(msg) {
                        self.run_pass();
                    }
                }

                _ = interval.tick() => self.run_pass(),
            }
        }
    }

    /// Applies one message. Returns true when an allocation pass should follow.
    fn handle(&mut self, msg: SchedulerMessage) -> bool {
        match msg {
            SchedulerMessage::NodeAdded {
                node_id,
                capacity,
                reply,
            } => {
                let result = self.scheduler.add_node(node_id, capacity);
                let added = result.is_ok();
                let _ = reply.send(result);
                added
            }
            SchedulerMessage::NodeRemoved { node_id, reason } => {
                let actions = self.scheduler.remove_node(node_id, &reason);
                self.execute(actions);
                false
            }
            SchedulerMessage::NodeHeartbeat {
                node_id,
                seq,
                reply,
            } => {
                let result = self.scheduler.heartbeat(node_id, seq);
                let accepted = result.is_ok();
                let _ = reply.send(result);
                accepted
            }
            SchedulerMessage::AttemptAdded {
                attempt_id,
                queue,
                submitted_seq,
            } => {
                let actions = self.scheduler.add_attempt(attempt_id, queue, submitted_seq);
                self.execute(actions);
                false
            }
            SchedulerMessage::AttemptRemoved { attempt_id } => {
                let actions = self.scheduler.remove_attempt(attempt_id);
                self.execute(actions);
                false
            }
            SchedulerMessage::Ask {
                attempt_id,
                asks,
                is_am,
            } => self.scheduler.add_asks(attempt_id, asks, is_am),
            SchedulerMessage::ContainerStarted { container_id } => {
                self.scheduler.container_started(container_id);
                false
            }
            SchedulerMessage::ContainerReleased { container_id } => {
                match self.scheduler.container_released(container_id) {
                    Ok(holding) => {
                        debug!(
                            container_id = %container_id,
                            attempt_id = %holding.attempt_id,
                            resource = %holding.resource,
                            "Container released"
                        );
                        true
                    }
                    Err(e) => {
                        debug!(container_id = %container_id, error = %e, "Release ignored");
                        false
                    }
                }
            }
            SchedulerMessage::Snapshot { reply } => {
                let _ = reply.send(self.scheduler.ledger().clone());
                false
            }
            SchedulerMessage::Schedule => true,
        }
    }

    /// Run a single allocation pass.
    fn run_pass(&mut self) {
        let actions = self.scheduler.schedule();
        if actions.is_empty() {
            return;
        }

        let granted = actions
            .iter()
            .filter(|a| matches!(a, SchedulerAction::Allocate(_)))
            .count();
        let preempted = actions
            .iter()
            .filter(|a| matches!(a, SchedulerAction::Preempt { .. }))
            .count();
        info!(granted, preempted, "Scheduler pass complete");

        self.execute(actions);
    }

    fn execute(&self, actions: Vec<SchedulerAction>) {
        let dispatcher = &self.services.dispatcher;

        for action in actions {
            match action {
                SchedulerAction::AttemptAccepted(attempt_id) => {
                    dispatcher.post_attempt(attempt_id, AttemptEvent::AttemptAdded);
                }
                SchedulerAction::Allocate(allocation) => {
                    let attempt_id = allocation.attempt_id;
                    dispatcher.register(Box::new(ContainerController::new(
                        allocation.clone(),
                        self.services.clone(),
                    )));
                    dispatcher.post_attempt(
                        attempt_id,
                        AttemptEvent::ContainerAllocated { allocation },
                    );
                }
                SchedulerAction::Preempt {
                    attempt_id,
                    container_id,
                    grace,
                } => {
                    dispatcher.post_attempt(
                        attempt_id,
                        AttemptEvent::PreemptContainer {
                            container_id,
                            grace,
                        },
                    );
                }
                SchedulerAction::Kill {
                    container_id,
                    exit_status,
                    diagnostics,
                } => {
                    dispatcher.post_container(
                        container_id,
                        ContainerEvent::Kill {
                            exit_status,
                            diagnostics,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_events::{EventPayload, Resource};
    use rm_id::{AppId, AttemptId, NodeId};

    use crate::config::QueueConfig;
    use crate::controller::{test_services, EntityController};
    use crate::dispatcher::ShardMessage;
    use crate::scheduler::{SchedulerHandle, SchedulerSettings};

    fn delivered(rx: &mut mpsc::UnboundedReceiver<ShardMessage>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ShardMessage::Register(controller) => {
                    seen.push(format!("register {}", controller.entity_id().kind()));
                }
                ShardMessage::Deliver(envelope) => seen.push(envelope.event_type().to_string()),
                ShardMessage::Flush(_) => {}
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_allocation_registers_container_before_notifying_attempt() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let (handle, rx) = SchedulerHandle::channel();
        let scheduler = Scheduler::new(&[QueueConfig::new("default", 100)], SchedulerSettings::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = SchedulerWorker::new(scheduler, rx, Duration::from_secs(3600), services);
        let task = tokio::spawn(worker.run(shutdown_rx));

        let node = NodeId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        handle.add_node(node, Resource::new(4096, 4)).await.unwrap().unwrap();
        handle.attempt_added(attempt, "default".to_string(), 1);
        handle.am_ask(attempt, Resource::new(1024, 1));

        // the snapshot reply orders after every earlier message
        let ledger = handle.snapshot().await.unwrap();
        assert_eq!(ledger.container_count(), 1);

        assert_eq!(
            delivered(&mut shard_rx),
            vec!["ATTEMPT_ADDED", "register container", "CONTAINER_ALLOCATED"]
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_node_removal_kills_containers() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let (handle, rx) = SchedulerHandle::channel();
        let scheduler = Scheduler::new(&[QueueConfig::new("default", 100)], SchedulerSettings::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(SchedulerWorker::new(scheduler, rx, Duration::from_secs(3600), services).run(shutdown_rx));

        let node = NodeId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        handle.add_node(node, Resource::new(4096, 4)).await.unwrap().unwrap();
        handle.attempt_added(attempt, "default".to_string(), 1);
        handle.am_ask(attempt, Resource::new(1024, 1));
        handle.remove_node(node, "lost");

        let ledger = handle.snapshot().await.unwrap();
        assert!(ledger.node(&node).is_none());
        assert_eq!(ledger.container_count(), 0);

        let mut kills = 0;
        while let Ok(msg) = shard_rx.try_recv() {
            if let ShardMessage::Deliver(envelope) = msg {
                if let EventPayload::Container(ContainerEvent::Kill { exit_status, .. }) =
                    envelope.payload
                {
                    assert_eq!(exit_status, rm_events::exit_status::ABORTED);
                    kills += 1;
                }
            }
        }
        assert_eq!(kills, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_heartbeat_rejected() {
        let (services, _shard_rx, _scheduler_rx) = test_services();
        let (handle, rx) = SchedulerHandle::channel();
        let scheduler = Scheduler::new(&[QueueConfig::new("default", 100)], SchedulerSettings::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(SchedulerWorker::new(scheduler, rx, Duration::from_secs(3600), services).run(shutdown_rx));

        let node = NodeId::new();
        handle.add_node(node, Resource::new(1024, 1)).await.unwrap().unwrap();
        assert!(handle.heartbeat(node, 5).await.unwrap().is_ok());
        assert!(handle.heartbeat(node, 5).await.unwrap().is_ok());
        assert!(handle.heartbeat(node, 4).await.unwrap().is_err());
    }
}
