//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into submission, flag and catalog APIs.
//! - Own transactional boundaries for count writes.

pub mod catalog_service;
pub mod dependency_service;
pub mod flag_service;
pub mod submission_service;
pub mod validation;
