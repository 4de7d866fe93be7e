//! Macros and parsing helpers for typed IDs.

use crate::{IdError, Ulid};

/// Splits `{prefix}_{ulid}` and parses the ULID part.
///
/// Shared by every flat ID type and by the application part of attempt IDs.
#[doc(hidden)]
pub fn parse_prefixed(s: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, ulid_str)) = s.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    ulid_str
        .parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}

/// Defines a typed, ULID-backed ID with a fixed string prefix.
///
/// The generated type is `Copy`, ordered by creation time, and serializes
/// as its canonical `{prefix}_{ulid}` string.
///
/// ```ignore
/// define_id!(NodeId, "node");
///
/// let node = NodeId::new();
/// let parsed: NodeId = node.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses an ID in the `{prefix}_{ulid}` format.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
