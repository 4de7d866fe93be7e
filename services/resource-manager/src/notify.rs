//! Outward container notifications.
//!
//! [`NotificationBus`] wraps [`tokio::sync::broadcast`]: publishing never
//! blocks, subscribers only see notifications sent after they subscribe, and
//! a subscriber that falls behind observes `RecvError::Lagged(n)`.

use rm_events::ContainerNotification;
use tokio::sync::broadcast;

/// Broadcast channel for container completion notices.
#[derive(Clone, Debug)]
pub struct NotificationBus {
    tx: broadcast::Sender<ContainerNotification>,
}

impl NotificationBus {
    /// Creates a bus buffering up to `capacity` notifications (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes to every current subscriber. Dropped when there are none.
    pub fn publish(&self, notification: ContainerNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerNotification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_id::{AppId, AttemptId, ContainerId, NodeId};

    #[tokio::test]
    async fn test_subscribers_see_later_notifications() {
        let bus = NotificationBus::new(4);
        let container_id = ContainerId::new();
        let notification = ContainerNotification::Exited {
            container_id,
            attempt_id: AttemptId::new(AppId::new(), 1),
            node_id: NodeId::new(),
            exit_code: 0,
            diagnostics: String::new(),
        };

        // nobody listening yet
        bus.publish(notification.clone());

        let mut rx = bus.subscribe();
        bus.publish(notification.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.container_id(), container_id);
        assert!(rx.try_recv().is_err());
    }
}
