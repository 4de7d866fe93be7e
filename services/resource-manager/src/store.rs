//! State store interface and in-memory implementation.
//!
//! Controllers persist snapshots on transitions into saving states and on
//! reaching a terminal state. Recovery reads everything back with `load`.
//! Durable mechanics live behind [`StateStore`]; the core only reacts to a
//! save completing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rm_events::{EntityId, Snapshot};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors from a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient failure; the save may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("snapshot for {entity} does not belong to it")]
    EntityMismatch { entity: EntityId },

    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Persistence of entity snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saves the latest snapshot of `entity`, replacing any earlier one.
    async fn save(&self, entity: EntityId, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Every saved snapshot.
    async fn load(&self) -> Result<Vec<Snapshot>, StoreError>;
}

// =============================================================================
// Memory Store
// =============================================================================

/// Keeps snapshots in memory, JSON-encoded as a durable store would hold
/// them. Used by tests and the standalone binary.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<BTreeMap<EntityId, String>>,

    /// Remaining saves that fail with `Unavailable`.
    failures_left: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose first `failures` saves fail.
    pub fn flaky(failures: u32) -> Self {
        Self {
            snapshots: RwLock::default(),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub async fn get(&self, entity: &EntityId) -> Option<Snapshot> {
        let snapshots = self.snapshots.read().await;
        let encoded = snapshots.get(entity)?;
        serde_json::from_str(encoded).ok()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, entity: EntityId, snapshot: Snapshot) -> Result<(), StoreError> {
        if snapshot.entity_id() != entity {
            return Err(StoreError::EntityMismatch { entity });
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let encoded = serde_json::to_string(&snapshot)?;
        debug!(entity = %entity, bytes = encoded.len(), "Saved snapshot");
        self.snapshots.write().await.insert(entity, encoded);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        let mut loaded = Vec::with_capacity(snapshots.len());
        for encoded in snapshots.values() {
            loaded.push(serde_json::from_str(encoded)?);
        }
        Ok(loaded)
    }
}

// =============================================================================
// Retries
// =============================================================================

/// Exponential backoff between save retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any delay.
    pub max: Duration,

    /// Attempts in total, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `retry`-th failure (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Retries transient save failures of an inner store with backoff.
pub struct RetryingStore<S> {
    inner: S,
    policy: BackoffPolicy,
}

impl<S: StateStore> RetryingStore<S> {
    pub fn new(inner: S, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: StateStore> StateStore for RetryingStore<S> {
    async fn save(&self, entity: EntityId, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut retry = 0;
        loop {
            match self.inner.save(entity, snapshot.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Unavailable(reason)) if retry + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(retry);
                    warn!(
                        entity = %entity,
                        reason = %reason,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Snapshot save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load(&self) -> Result<Vec<Snapshot>, StoreError> {
        self.inner.load().await
    }
}
