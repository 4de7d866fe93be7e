//! Liveliness monitoring.
//!
//! Tracks the last ping of every registered key and reports keys that have
//! been silent longer than the expiry. State machines never see a clock:
//! the monitor turns silence into an event (attempt `EXPIRE`, node removal).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Expiry tracker shared by its owner and its run loop.
#[derive(Clone)]
pub struct LivelinessMonitor<K> {
    name: &'static str,
    expiry: Duration,
    last_seen: Arc<Mutex<HashMap<K, Instant>>>,
}

impl<K> LivelinessMonitor<K>
where
    K: Copy + Eq + Hash + std::fmt::Display + Send + 'static,
{
    pub fn new(name: &'static str, expiry: Duration) -> Self {
        Self {
            name,
            expiry,
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts tracking `key` as of now.
    pub fn register(&self, key: K) {
        self.entries().insert(key, Instant::now());
    }

    /// Refreshes a registered key. Unknown keys are ignored.
    pub fn ping(&self, key: K) {
        if let Some(seen) = self.entries().get_mut(&key) {
            *seen = Instant::now();
        }
    }

    pub fn unregister(&self, key: K) {
        self.entries().remove(&key);
    }

    pub fn is_registered(&self, key: K) -> bool {
        self.entries().contains_key(&key)
    }

    /// Removes and returns every key silent for longer than the expiry.
    pub fn take_expired(&self, now: Instant) -> Vec<K> {
        let mut entries = self.entries();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.expiry)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
    }

    /// Checks every `check_interval` until shutdown, handing each expired
    /// key to `on_expire` exactly once.
    #[instrument(skip(self, on_expire, shutdown), fields(monitor = self.name))]
    pub async fn run<F>(self, check_interval: Duration, on_expire: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(K) + Send,
    {
        info!(
            expiry_ms = self.expiry.as_millis() as u64,
            check_interval_ms = check_interval.as_millis() as u64,
            "Starting liveliness monitor"
        );

        let mut interval = tokio::time::interval(check_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for key in self.take_expired(Instant::now()) {
                        info!(key = %key, "Expired");
                        on_expire(key);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Liveliness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Instant>> {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_id::{AppId, AttemptId};

    #[tokio::test(start_paused = true)]
    async fn test_ping_postpones_expiry() {
        let monitor = LivelinessMonitor::new("am", Duration::from_secs(10));
        let attempt = AttemptId::new(AppId::new(), 1);
        monitor.register(attempt);

        tokio::time::advance(Duration::from_secs(8)).await;
        monitor.ping(attempt);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(monitor.take_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(monitor.take_expired(Instant::now()), vec![attempt]);
        assert!(!monitor.is_registered(attempt));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_does_not_register() {
        let monitor = LivelinessMonitor::new("am", Duration::from_secs(1));
        let attempt = AttemptId::new(AppId::new(), 1);
        monitor.ping(attempt);
        assert!(!monitor.is_registered(attempt));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_each_key_once() {
        let monitor = LivelinessMonitor::new("am", Duration::from_secs(5));
        let attempt = AttemptId::new(AppId::new(), 1);
        monitor.register(attempt);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.clone().run(
            Duration::from_secs(1),
            move |key| {
                let _ = tx.send(key);
            },
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(20)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(rx.recv().await, Some(attempt));
        assert!(rx.try_recv().is_err());
    }
}
