//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use rm_core::config::{Config, PreemptionConfig, QueueConfig};
use rm_core::ResourceManager;
use rm_events::{EntityState, Resource};
use rm_id::{ContainerId, NodeId};

/// Polls `check` until it returns true or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for an entity to reach `state`.
pub async fn wait_for_state(
    manager: &ResourceManager,
    entity: impl Into<rm_events::EntityId> + Copy,
    state: impl Into<EntityState> + Copy,
) -> bool {
    wait_until(Duration::from_secs(5), move || async move {
        manager.get_state(entity) == Some(state.into())
    })
    .await
}

/// Fast scheduling, single default queue.
pub fn test_config() -> Config {
    Config {
        dispatcher_workers: 4,
        scheduler_interval: Duration::from_millis(20),
        liveness_check_interval: Duration::from_millis(20),
        ..Config::default()
    }
}

/// Two queues splitting the cluster evenly, immediate preemption.
pub fn two_queue_config() -> Config {
    Config {
        queues: vec![QueueConfig::new("a", 50), QueueConfig::new("b", 50)],
        preemption: PreemptionConfig {
            enabled: true,
            grace: Duration::ZERO,
            ..PreemptionConfig::default()
        },
        ..test_config()
    }
}

pub async fn add_node(manager: &ResourceManager, memory_mb: u64, vcores: u32) -> NodeId {
    let node_id = NodeId::new();
    manager
        .register_node(node_id, Resource::new(memory_mb, vcores))
        .await
        .expect("node registers");
    node_id
}

/// Containers the ledger currently holds for `attempt`, with their size.
pub async fn containers_of(
    manager: &ResourceManager,
    attempt: rm_id::AttemptId,
) -> Vec<(ContainerId, Resource)> {
    let ledger = manager.ledger_snapshot().await.expect("scheduler running");
    ledger
        .nodes()
        .flat_map(|(_, node)| node.containers.iter())
        .filter(|(_, holding)| holding.attempt_id == attempt)
        .map(|(id, holding)| (*id, holding.resource))
        .collect()
}
