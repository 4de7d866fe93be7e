//! Lifecycle states for every entity kind.
//!
//! Each kind has a closed state set, the initial state `New`, and a fixed
//! terminal subset after which no transition is accepted.

use serde::{Deserialize, Serialize};

macro_rules! state_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Every declared state, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Canonical upper-case name.
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
    };
}

/// Application lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    New,
    NewSaving,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

state_names!(AppState {
    New => "NEW",
    NewSaving => "NEW_SAVING",
    Accepted => "ACCEPTED",
    Running => "RUNNING",
    Finished => "FINISHED",
    Failed => "FAILED",
    Killed => "KILLED",
});

impl AppState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

/// Application attempt lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    New,
    Submitted,
    Scheduled,
    AllocatedSaving,
    Allocated,
    Launched,
    Running,
    FinalSaving,
    Finishing,
    Finished,
    Failed,
    Killed,
}

state_names!(AttemptState {
    New => "NEW",
    Submitted => "SUBMITTED",
    Scheduled => "SCHEDULED",
    AllocatedSaving => "ALLOCATED_SAVING",
    Allocated => "ALLOCATED",
    Launched => "LAUNCHED",
    Running => "RUNNING",
    FinalSaving => "FINAL_SAVING",
    Finishing => "FINISHING",
    Finished => "FINISHED",
    Failed => "FAILED",
    Killed => "KILLED",
});

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    New,
    Localizing,
    Running,
    ExitedWithSuccess,
    ExitedWithFailure,
    Killing,
    Done,
}

state_names!(ContainerState {
    New => "NEW",
    Localizing => "LOCALIZING",
    Running => "RUNNING",
    ExitedWithSuccess => "EXITED_WITH_SUCCESS",
    ExitedWithFailure => "EXITED_WITH_FAILURE",
    Killing => "KILLING",
    Done => "DONE",
});

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// True once user code may have started.
    pub fn has_started(&self) -> bool {
        !matches!(self, Self::New | Self::Localizing)
    }
}

/// State of any entity, as reported by the query interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum EntityState {
    App(AppState),
    Attempt(AttemptState),
    Container(ContainerState),
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        match self {
            EntityState::App(s) => s.is_terminal(),
            EntityState::Attempt(s) => s.is_terminal(),
            EntityState::Container(s) => s.is_terminal(),
        }
    }
}

impl From<AppState> for EntityState {
    fn from(state: AppState) -> Self {
        EntityState::App(state)
    }
}

impl From<AttemptState> for EntityState {
    fn from(state: AttemptState) -> Self {
        EntityState::Attempt(state)
    }
}

impl From<ContainerState> for EntityState {
    fn from(state: ContainerState) -> Self {
        EntityState::Container(state)
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityState::App(s) => write!(f, "{s}"),
            EntityState::Attempt(s) => write!(f, "{s}"),
            EntityState::Container(s) => write!(f, "{s}"),
        }
    }
}

/// Final status an application master reports when it unregisters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    #[default]
    Undefined,
    Succeeded,
    Failed,
    Killed,
}
