//! Repository layer abstractions and SQLite implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for the catalog,
//!   aggregate groups, counts and flags.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Count, group and flag repositories never open transactions; the
//!   calling service owns the boundary and hands them the transaction.
//!   Indicator registration is the one catalog write with its own.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::catalog::EntityRef;
use crate::model::flag::TargetKind;
use chrono::NaiveDate;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod catalog_repo;
pub mod count_repo;
pub mod flag_repo;
pub mod group_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Generic repository error for persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound(EntityRef),
    /// Flag target kind has no lookup registered.
    UnregisteredTarget(TargetKind),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(entity) => write!(f, "{entity} not found"),
            Self::UnregisteredTarget(kind) => {
                write!(f, "no lookup registered for flag target kind `{}`", kind.as_str())
            }
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::UnregisteredTarget(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn parse_optional_uuid(
    value: Option<String>,
    column: &'static str,
) -> RepoResult<Option<Uuid>> {
    value.map(|value| parse_uuid(&value, column)).transpose()
}

pub(crate) fn parse_date(value: &str, column: &'static str) -> RepoResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| RepoError::InvalidData(format!("invalid date `{value}` in {column}")))
}

pub(crate) fn parse_bool(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean `{other}` in {column}"
        ))),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn row_exists(conn: &Connection, sql: &str, id: Uuid) -> rusqlite::Result<bool> {
    let exists: i64 = conn.query_row(sql, [id.to_string()], |row| row.get(0))?;
    Ok(exists == 1)
}

/// Builds `?, ?, ?` for an `IN (...)` list of `len` bindings.
pub(crate) fn placeholders(len: usize) -> String {
    vec!["?"; len].join(", ")
}

pub(crate) fn date_to_db(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}
