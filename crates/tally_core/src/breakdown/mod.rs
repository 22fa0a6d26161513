//! Breakdown schema matching and value coercion.
//!
//! # Responsibility
//! - Derive the active dimension set of a batch and per-row composite keys.
//! - Coerce raw value tokens into non-negative counts.
//!
//! # Invariants
//! - Schemas and keys are ordered lexicographically by dimension name.
//! - Key composition never depends on row order within a batch.

pub mod schema;
pub mod value;
