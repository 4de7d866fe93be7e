//! Persisted entity snapshots.
//!
//! Snapshots are what the state store saves on transitions into saving
//! states and what recovery replays into fresh controllers.

use rm_id::{AppId, AttemptId, ContainerId};
use serde::{Deserialize, Serialize};

use crate::{AppState, AttemptState, EntityId, FinalStatus, LaunchContext, Resource};

/// Saved view of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub app_id: AppId,
    pub name: String,
    pub queue: String,
    pub am_resource: Resource,
    pub am_context: LaunchContext,
    /// Launch context for containers the application master asks for.
    #[serde(default)]
    pub container_context: LaunchContext,
    pub max_attempts: u32,
    /// Position in submission order, used by FIFO ordering.
    pub submitted_seq: u64,
    pub state: AppState,
    /// Number of attempts created so far.
    pub attempts: u32,
    pub final_status: FinalStatus,
    pub diagnostics: Vec<String>,
}

/// Saved view of an application attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub attempt_id: AttemptId,
    pub state: AttemptState,
    /// Target state recorded when entering FINAL_SAVING.
    pub final_state: Option<AttemptState>,
    pub am_container: Option<ContainerId>,
    pub host: Option<String>,
    pub rpc_port: Option<u16>,
    pub tracking_url: Option<String>,
    pub final_status: FinalStatus,
    pub diagnostics: Vec<String>,
}

/// Any persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    App(AppSnapshot),
    Attempt(AttemptSnapshot),
}

impl Snapshot {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Snapshot::App(s) => EntityId::App(s.app_id),
            Snapshot::Attempt(s) => EntityId::Attempt(s.attempt_id),
        }
    }
}
