//! Resource manager orchestration core.
//!
//! This crate primarily ships a `resource-manager` binary, but the core is
//! exposed as a library so it can be embedded behind an RPC layer and
//! driven directly by integration tests.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use controller::{AppSpec, EntityController};
pub use manager::{ManagerError, ResourceManager};
pub use scheduler::ResourceAsk;
