//! Typed ID definitions for resource manager entities.

use crate::{define_id, IdError, Ulid};

// =============================================================================
// Cluster Entities
// =============================================================================

define_id!(AppId, "app");
define_id!(NodeId, "node");
define_id!(ContainerId, "ctr");

// =============================================================================
// Application Attempts
// =============================================================================

/// Identifier of one execution attempt of an application.
///
/// Attempt numbers start at 1 and increase for every retry of the same
/// application, so attempts of one application sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId {
    app_id: AppId,
    attempt: u32,
}

impl AttemptId {
    /// The prefix for attempt IDs.
    pub const PREFIX: &'static str = "appattempt";

    /// Creates the ID of attempt number `attempt` of `app_id`.
    #[must_use]
    pub const fn new(app_id: AppId, attempt: u32) -> Self {
        Self { app_id, attempt }
    }

    /// The application this attempt belongs to.
    #[must_use]
    pub const fn app_id(&self) -> AppId {
        self.app_id
    }

    /// The 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the ID of the attempt that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self {
            app_id: self.app_id,
            attempt: self.attempt + 1,
        }
    }

    /// Parses `appattempt_{ulid}_{number}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some(rest) = s.strip_prefix(Self::PREFIX) else {
            let actual = s.split('_').next().unwrap_or_default().to_string();
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual,
            });
        };
        let Some(rest) = rest.strip_prefix('_') else {
            return Err(IdError::MissingSeparator);
        };
        let Some((ulid, number)) = rest.rsplit_once('_') else {
            return Err(IdError::MissingSeparator);
        };

        let app_ulid = ulid
            .parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;
        let attempt: u32 = number
            .parse()
            .map_err(|_| IdError::InvalidAttemptNumber(number.to_string()))?;
        if attempt == 0 {
            return Err(IdError::InvalidAttemptNumber(number.to_string()));
        }

        Ok(Self::new(AppId::from_ulid(app_ulid), attempt))
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{:06}",
            Self::PREFIX,
            self.app_id.ulid(),
            self.attempt
        )
    }
}

impl std::str::FromStr for AttemptId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for AttemptId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AttemptId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Process-wide monotonic event identifier, assigned when an event is posted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
