//! # rm-events
//!
//! Event, state, and resource definitions shared by the resource manager.
//!
//! ## Design Principles
//!
//! - Events are immutable once constructed
//! - Every event targets exactly one entity (application, attempt, container)
//! - Each entity kind has a closed set of event tags; each tag carries its
//!   own fixed field set
//! - States are closed per-kind enums with a fixed initial and terminal set
//!
//! ## Event Envelope
//!
//! All events share an envelope with:
//! - Global post order (`event_id`)
//! - Target entity (`target`)
//! - Occurrence time (`occurred_at`)

mod envelope;
mod error;
mod resource;
mod snapshot;
mod states;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use resource::Resource;
pub use snapshot::*;
pub use states::*;
pub use types::*;
