//! Domain model for counts, their owning scopes, and advisory flags.
//!
//! # Responsibility
//! - Define the records exchanged between repositories and services.
//! - Define the request/response shapes exposed to collaborators.
//!
//! # Invariants
//! - Every persisted record is identified by a stable UUID.
//! - Count values are non-negative integers.
//! - Date windows are inclusive on both ends and never inverted.

pub mod catalog;
pub mod count;
pub mod flag;
pub mod window;
