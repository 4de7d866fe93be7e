//! Cross-queue preemption through the running scheduler.

mod common;

use std::time::Duration;

use common::{add_node, containers_of, two_queue_config, wait_for_state, wait_until};
use rm_core::config::PreemptionConfig;
use rm_core::{AppSpec, ResourceAsk, ResourceManager};
use rm_events::{exit_status, AppState, AttemptState, ContainerNotification, ContainerState, Resource};
use rm_id::{AttemptId, NodeId};

/// Fills a 4 GB node from queue `a`: an AM plus three running workers.
async fn fill_from_queue_a(manager: &ResourceManager) -> (NodeId, AttemptId) {
    let node = add_node(manager, 4096, 4).await;

    let app = manager
        .submit_application(AppSpec::new("hog", "a", Resource::new(1024, 1)))
        .unwrap();
    let attempt = AttemptId::new(app, 1);
    assert!(wait_for_state(manager, attempt, AttemptState::Launched).await);
    manager
        .register_application_master(attempt, "hog-am", 9000, None)
        .unwrap();
    assert!(wait_for_state(manager, attempt, AttemptState::Running).await);

    manager
        .allocate(attempt, vec![ResourceAsk::new(Resource::new(1024, 1), 3)], 0.0)
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || async {
            containers_of(manager, attempt).await.len() == 4
        })
        .await
    );
    for (container, _) in containers_of(manager, attempt).await {
        assert!(wait_for_state(manager, container, ContainerState::Running).await);
    }

    (node, attempt)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_starved_queue_reclaims_a_worker() {
    let manager = ResourceManager::start(two_queue_config());
    let mut notifications = manager.subscribe();
    let (node, hog) = fill_from_queue_a(&manager).await;
    assert_eq!(
        manager.ledger_snapshot().await.unwrap().node(&node).unwrap().available(),
        Resource::ZERO
    );

    let app = manager
        .submit_application(AppSpec::new("starved", "b", Resource::new(1024, 1)))
        .unwrap();
    let attempt = AttemptId::new(app, 1);

    assert!(wait_for_state(&manager, attempt, AttemptState::Launched).await);

    // One worker went; the hog keeps its AM and stays running.
    let remaining = containers_of(&manager, hog).await;
    assert_eq!(remaining.len(), 3);
    assert_eq!(manager.get_state(hog), Some(AttemptState::Running.into()));

    let killed = loop {
        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification arrives")
            .expect("bus open");
        if let ContainerNotification::Killed {
            container_id,
            attempt_id,
            exit_status: status,
            ..
        } = notification
        {
            assert_eq!(attempt_id, hog);
            assert_eq!(status, exit_status::PREEMPTED);
            break container_id;
        }
    };
    assert!(remaining.iter().all(|(id, _)| *id != killed));

    let ledger = manager.ledger_snapshot().await.unwrap();
    assert!(ledger.is_consistent());
    let entry = ledger.node(&node).unwrap();
    assert_eq!(entry.used, entry.capacity);
    assert_eq!(ledger.queue("b").unwrap().used, Resource::new(1024, 1));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_preemption_leaves_ask_pending() {
    let config = rm_core::Config {
        preemption: PreemptionConfig {
            enabled: false,
            ..PreemptionConfig::default()
        },
        ..two_queue_config()
    };
    let manager = ResourceManager::start(config);
    let (_, hog) = fill_from_queue_a(&manager).await;

    let app = manager
        .submit_application(AppSpec::new("starved", "b", Resource::new(1024, 1)))
        .unwrap();
    let attempt = AttemptId::new(app, 1);
    assert!(wait_for_state(&manager, attempt, AttemptState::Scheduled).await);

    // Several scheduling passes later nothing has moved.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        manager.get_state(attempt),
        Some(AttemptState::Scheduled.into())
    );
    assert_eq!(containers_of(&manager, hog).await.len(), 4);
    assert_eq!(manager.get_state(app), Some(AppState::Accepted.into()));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_loss_fails_the_attempt() {
    let manager = ResourceManager::start(two_queue_config());
    let (node, hog) = fill_from_queue_a(&manager).await;

    manager.decommission_node(node);

    // The AM went with the node; ABORTED does not spend the retry budget.
    assert!(wait_for_state(&manager, hog, AttemptState::Failed).await);
    let next = hog.next();
    assert!(wait_for_state(&manager, next, AttemptState::Scheduled).await);
    assert_eq!(
        manager.ledger_snapshot().await.unwrap().container_count(),
        0
    );

    manager.shutdown().await;
}
