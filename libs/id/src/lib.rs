//! # rm-id
//!
//! Typed identifiers for the resource manager.
//!
//! ## Design Principles
//!
//! - IDs are system-generated and typed to prevent mixing entity kinds
//! - All IDs have a canonical string representation with strict parsing
//! - IDs roundtrip through serde as their canonical string
//!
//! ## ID Format
//!
//! Flat resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `node_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `ctr_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//!
//! Attempt IDs are scoped to their application and carry a 1-based attempt
//! number: `appattempt_01HV4Z3MXNKPQR9HSTZ7WCLD4E_000002`.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::parse_prefixed;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
