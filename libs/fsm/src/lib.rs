//! Table-driven state machine primitives.
//!
//! Every long-lived entity (application, attempt, container) is driven by a
//! [`StateMachine`]: a per-entity cursor over a [`TransitionTable`] shared by
//! all entities of that kind. Key concepts:
//!
//! - **Arc**: `(state, event tag)` maps to one next state, a declared set of
//!   next states chosen by a hook at dispatch time, or an explicit ignore.
//! - **Hook**: side effect run before the next state is committed. A failing
//!   hook leaves the state unchanged.
//! - **Terminal absorption**: once terminal, any tag that leads into a
//!   terminal state somewhere in the table is accepted as a no-op, so
//!   duplicate deliveries of terminal-directed events are harmless.
//!
//! # Invariants
//!
//! - Tables are immutable once built and are read without locking
//! - A machine never holds a state outside its table's declared set
//! - A machine never leaves a terminal state

mod error;
mod machine;
mod table;

pub use error::{HookError, TransitionError};
pub use machine::{Outcome, StateMachine};
pub use table::{ChoiceHook, Hook, TableBuilder, TransitionTable};
