//! Event type definitions for every entity kind.
//!
//! Each kind has a payload enum (one variant per event tag, carrying that
//! tag's fields) and a field-less tag enum used as the transition-table key.

use std::collections::BTreeMap;
use std::time::Duration;

use rm_id::{AppId, AttemptId, ContainerId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{AppSnapshot, AttemptSnapshot, EventError, FinalStatus, Resource};

// =============================================================================
// Entity Identity
// =============================================================================

/// Kind of entity an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    App,
    Attempt,
    Container,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::App => "app",
            EntityKind::Attempt => "attempt",
            EntityKind::Container => "container",
        };
        f.write_str(s)
    }
}

/// Identifier of any entity driven by a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityId {
    App(AppId),
    Attempt(AttemptId),
    Container(ContainerId),
}

impl EntityId {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityId::App(_) => EntityKind::App,
            EntityId::Attempt(_) => EntityKind::Attempt,
            EntityId::Container(_) => EntityKind::Container,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::App(id) => write!(f, "{id}"),
            EntityId::Attempt(id) => write!(f, "{id}"),
            EntityId::Container(id) => write!(f, "{id}"),
        }
    }
}

impl From<AppId> for EntityId {
    fn from(id: AppId) -> Self {
        EntityId::App(id)
    }
}

impl From<AttemptId> for EntityId {
    fn from(id: AttemptId) -> Self {
        EntityId::Attempt(id)
    }
}

impl From<ContainerId> for EntityId {
    fn from(id: ContainerId) -> Self {
        EntityId::Container(id)
    }
}

// =============================================================================
// Event Tags
// =============================================================================

macro_rules! event_tags {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $ty {
            $($variant),+
        }

        impl $ty {
            /// Every tag of this kind, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(EventError::UnknownEventType(other.to_string())),
                }
            }
        }
    };
}

event_tags!(
    /// Application event tags.
    AppEventType {
        Start => "START",
        AppNewSaved => "APP_NEW_SAVED",
        AttemptRegistered => "ATTEMPT_REGISTERED",
        AttemptFinished => "ATTEMPT_FINISHED",
        AttemptFailed => "ATTEMPT_FAILED",
        AttemptKilled => "ATTEMPT_KILLED",
        Kill => "KILL",
        Recover => "RECOVER",
    }
);

event_tags!(
    /// Application attempt event tags.
    AttemptEventType {
        Start => "START",
        AttemptAdded => "ATTEMPT_ADDED",
        ContainerAllocated => "CONTAINER_ALLOCATED",
        AttemptNewSaved => "ATTEMPT_NEW_SAVED",
        Launched => "LAUNCHED",
        Registered => "REGISTERED",
        StatusUpdate => "STATUS_UPDATE",
        ContainerFinished => "CONTAINER_FINISHED",
        Unregistered => "UNREGISTERED",
        AttemptUpdateSaved => "ATTEMPT_UPDATE_SAVED",
        Expire => "EXPIRE",
        Kill => "KILL",
        Recover => "RECOVER",
        PreemptContainer => "PREEMPT_CONTAINER",
    }
);

event_tags!(
    /// Container event tags.
    ContainerEventType {
        Request => "REQUEST",
        Localized => "LOCALIZED",
        LocalizationFailed => "LOCALIZATION_FAILED",
        Exited => "EXITED",
        Kill => "KILL",
        CleanedUp => "CLEANED_UP",
    }
);

// =============================================================================
// Payloads
// =============================================================================

/// Events targeting an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    Start,
    AppNewSaved,
    AttemptRegistered {
        attempt_id: AttemptId,
    },
    AttemptFinished {
        attempt_id: AttemptId,
        final_status: FinalStatus,
        diagnostics: String,
    },
    AttemptFailed {
        attempt_id: AttemptId,
        diagnostics: String,
        /// False for failures the application is not to blame for
        /// (preemption, node loss, restart).
        counts_toward_failures: bool,
    },
    AttemptKilled {
        attempt_id: AttemptId,
        diagnostics: String,
    },
    Kill {
        diagnostics: String,
    },
    Recover {
        snapshot: AppSnapshot,
    },
}

impl AppEvent {
    pub fn event_type(&self) -> AppEventType {
        match self {
            AppEvent::Start => AppEventType::Start,
            AppEvent::AppNewSaved => AppEventType::AppNewSaved,
            AppEvent::AttemptRegistered { .. } => AppEventType::AttemptRegistered,
            AppEvent::AttemptFinished { .. } => AppEventType::AttemptFinished,
            AppEvent::AttemptFailed { .. } => AppEventType::AttemptFailed,
            AppEvent::AttemptKilled { .. } => AppEventType::AttemptKilled,
            AppEvent::Kill { .. } => AppEventType::Kill,
            AppEvent::Recover { .. } => AppEventType::Recover,
        }
    }
}

/// Events targeting an application attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptEvent {
    Start,
    AttemptAdded,
    ContainerAllocated {
        allocation: Allocation,
    },
    AttemptNewSaved,
    Launched,
    Registered {
        host: String,
        rpc_port: u16,
        tracking_url: Option<String>,
    },
    StatusUpdate {
        progress: f32,
    },
    ContainerFinished {
        status: ContainerStatus,
    },
    Unregistered {
        final_status: FinalStatus,
        diagnostics: String,
        tracking_url: Option<String>,
    },
    AttemptUpdateSaved,
    Expire,
    Kill {
        diagnostics: String,
    },
    Recover {
        snapshot: AttemptSnapshot,
    },
    PreemptContainer {
        container_id: ContainerId,
        grace: Duration,
    },
}

impl AttemptEvent {
    pub fn event_type(&self) -> AttemptEventType {
        match self {
            AttemptEvent::Start => AttemptEventType::Start,
            AttemptEvent::AttemptAdded => AttemptEventType::AttemptAdded,
            AttemptEvent::ContainerAllocated { .. } => AttemptEventType::ContainerAllocated,
            AttemptEvent::AttemptNewSaved => AttemptEventType::AttemptNewSaved,
            AttemptEvent::Launched => AttemptEventType::Launched,
            AttemptEvent::Registered { .. } => AttemptEventType::Registered,
            AttemptEvent::StatusUpdate { .. } => AttemptEventType::StatusUpdate,
            AttemptEvent::ContainerFinished { .. } => AttemptEventType::ContainerFinished,
            AttemptEvent::Unregistered { .. } => AttemptEventType::Unregistered,
            AttemptEvent::AttemptUpdateSaved => AttemptEventType::AttemptUpdateSaved,
            AttemptEvent::Expire => AttemptEventType::Expire,
            AttemptEvent::Kill { .. } => AttemptEventType::Kill,
            AttemptEvent::Recover { .. } => AttemptEventType::Recover,
            AttemptEvent::PreemptContainer { .. } => AttemptEventType::PreemptContainer,
        }
    }
}

/// Events targeting a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerEvent {
    Request {
        context: LaunchContext,
    },
    Localized,
    LocalizationFailed {
        diagnostics: String,
    },
    Exited {
        exit_code: i32,
        diagnostics: String,
    },
    Kill {
        /// Exit status reported to the application, see [`exit_status`].
        exit_status: i32,
        diagnostics: String,
    },
    CleanedUp,
}

impl ContainerEvent {
    pub fn event_type(&self) -> ContainerEventType {
        match self {
            ContainerEvent::Request { .. } => ContainerEventType::Request,
            ContainerEvent::Localized => ContainerEventType::Localized,
            ContainerEvent::LocalizationFailed { .. } => ContainerEventType::LocalizationFailed,
            ContainerEvent::Exited { .. } => ContainerEventType::Exited,
            ContainerEvent::Kill { .. } => ContainerEventType::Kill,
            ContainerEvent::CleanedUp => ContainerEventType::CleanedUp,
        }
    }
}

/// Tagged union of all payload kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum EventPayload {
    App(AppEvent),
    Attempt(AttemptEvent),
    Container(ContainerEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            EventPayload::App(_) => EntityKind::App,
            EventPayload::Attempt(_) => EntityKind::Attempt,
            EventPayload::Container(_) => EntityKind::Container,
        }
    }

    /// Canonical tag name, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::App(e) => e.event_type().as_str(),
            EventPayload::Attempt(e) => e.event_type().as_str(),
            EventPayload::Container(e) => e.event_type().as_str(),
        }
    }
}

// =============================================================================
// Shared Payload Fields
// =============================================================================

/// A container granted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub container_id: ContainerId,
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    pub queue: String,
    pub resource: Resource,
    pub priority: u32,
    /// True for the application master's own container.
    pub is_am: bool,
}

/// Completion status of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub exit_status: i32,
    pub diagnostics: String,
}

/// Visibility of a localized resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalResourceVisibility {
    Public,
    Private,
    #[default]
    Application,
}

/// A file to stage before the container starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResource {
    pub url: String,
    pub visibility: LocalResourceVisibility,
}

/// What to run in a container and what it needs staged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchContext {
    pub commands: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub local_resources: Vec<LocalResource>,
}

/// Container exit status codes reported to applications.
///
/// Non-negative values are process exit codes; negative values are
/// conditions detected by the resource manager.
pub mod exit_status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID: i32 = -1000;
    pub const ABORTED: i32 = -100;
    pub const DISKS_FAILED: i32 = -101;
    pub const PREEMPTED: i32 = -102;
    pub const KILLED_BY_APPMASTER: i32 = -105;
    pub const KILLED_BY_RESOURCEMANAGER: i32 = -106;
    pub const KILLED_AFTER_APP_COMPLETION: i32 = -107;

    /// True for statuses the application is not to blame for.
    pub fn is_external(status: i32) -> bool {
        matches!(status, ABORTED | DISKS_FAILED | PREEMPTED)
    }
}

// =============================================================================
// Outward Notifications
// =============================================================================

/// Container completion notice published for logging and metrics consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerNotification {
    Exited {
        container_id: ContainerId,
        attempt_id: AttemptId,
        node_id: NodeId,
        exit_code: i32,
        diagnostics: String,
    },
    Killed {
        container_id: ContainerId,
        attempt_id: AttemptId,
        node_id: NodeId,
        exit_status: i32,
        diagnostics: String,
    },
}

impl ContainerNotification {
    pub fn container_id(&self) -> ContainerId {
        match self {
            ContainerNotification::Exited { container_id, .. }
            | ContainerNotification::Killed { container_id, .. } => *container_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_by_name() {
        for tag in AttemptEventType::ALL {
            assert_eq!(tag.as_str().parse::<AttemptEventType>().unwrap(), *tag);
        }
        assert!(matches!(
            "BOGUS".parse::<ContainerEventType>(),
            Err(EventError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_payload_tags() {
        let ev = ContainerEvent::Kill {
            exit_status: exit_status::PREEMPTED,
            diagnostics: "preempted".into(),
        };
        assert_eq!(ev.event_type(), ContainerEventType::Kill);
        assert_eq!(EventPayload::Container(ev).type_name(), "KILL");
    }

    #[test]
    fn test_entity_id_kind() {
        let app = AppId::new();
        assert_eq!(EntityId::from(app).kind(), EntityKind::App);
        assert_eq!(
            EntityId::from(AttemptId::new(app, 1)).kind(),
            EntityKind::Attempt
        );
    }

    #[test]
    fn test_external_exit_statuses() {
        assert!(exit_status::is_external(exit_status::PREEMPTED));
        assert!(!exit_status::is_external(exit_status::KILLED_BY_APPMASTER));
        assert!(!exit_status::is_external(1));
    }
}
