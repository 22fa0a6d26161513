//! Flag repository and target registry.
//!
//! # Responsibility
//! - Persist flags against tagged `{kind, id}` targets.
//! - Resolve target existence through plain lookup functions per kind.
//!
//! # Invariants
//! - At most one unresolved flag per (target, reason); the partial unique
//!   index `uq_flags_open_reason` rejects a second insert.
//! - Resolution is one-way; resolved flags are never reopened.

use crate::model::catalog::EntityRef;
use crate::model::flag::{
    Flag, FlagId, FlagReasonType, FlagResolution, FlagTarget, NewFlag, TargetKind,
};
use crate::repo::{
    bool_to_int, parse_bool, parse_optional_uuid, parse_uuid, row_exists, RepoError, RepoResult,
};
use rusqlite::{params, Connection, Params, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const FLAG_SELECT_SQL: &str = "SELECT
    id,
    target_kind,
    target_id,
    reason,
    reason_type,
    auto_flagged,
    resolved,
    auto_resolved,
    caused_by,
    resolved_by,
    resolved_reason,
    created_at,
    resolved_at
FROM flags";

/// Existence lookup for one target kind.
pub type TargetLookup = fn(&Connection, Uuid) -> rusqlite::Result<bool>;

/// Lookup functions keyed by target kind.
#[derive(Clone)]
pub struct TargetRegistry {
    lookups: BTreeMap<TargetKind, TargetLookup>,
}

impl TargetRegistry {
    /// Registry without any lookups; every target is unregistered.
    pub fn empty() -> Self {
        Self {
            lookups: BTreeMap::new(),
        }
    }

    /// Adds or replaces the lookup for `kind`.
    pub fn register(mut self, kind: TargetKind, lookup: TargetLookup) -> Self {
        self.lookups.insert(kind, lookup);
        self
    }

    pub fn is_registered(&self, kind: TargetKind) -> bool {
        self.lookups.contains_key(&kind)
    }

    /// Runs the lookup registered for the target's kind.
    pub fn exists(&self, conn: &Connection, target: FlagTarget) -> RepoResult<bool> {
        let lookup = self
            .lookups
            .get(&target.kind)
            .ok_or(RepoError::UnregisteredTarget(target.kind))?;
        Ok(lookup(conn, target.id)?)
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::empty()
            .register(TargetKind::Count, count_exists)
            .register(TargetKind::AggregateGroup, group_exists)
            .register(TargetKind::Event, event_exists)
            .register(TargetKind::Task, task_exists)
            .register(TargetKind::Indicator, indicator_exists)
    }
}

fn count_exists(conn: &Connection, id: Uuid) -> rusqlite::Result<bool> {
    row_exists(conn, "SELECT EXISTS(SELECT 1 FROM counts WHERE id = ?1);", id)
}

fn group_exists(conn: &Connection, id: Uuid) -> rusqlite::Result<bool> {
    row_exists(
        conn,
        "SELECT EXISTS(SELECT 1 FROM aggregate_groups WHERE id = ?1);",
        id,
    )
}

fn event_exists(conn: &Connection, id: Uuid) -> rusqlite::Result<bool> {
    row_exists(conn, "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1);", id)
}

fn task_exists(conn: &Connection, id: Uuid) -> rusqlite::Result<bool> {
    row_exists(conn, "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1);", id)
}

fn indicator_exists(conn: &Connection, id: Uuid) -> rusqlite::Result<bool> {
    row_exists(
        conn,
        "SELECT EXISTS(SELECT 1 FROM indicators WHERE id = ?1);",
        id,
    )
}

/// Repository interface for flag persistence.
pub trait FlagRepository {
    fn insert_flag(&self, flag: &NewFlag) -> RepoResult<Flag>;
    fn get_flag(&self, id: FlagId) -> RepoResult<Option<Flag>>;
    /// Unresolved flags on `target`, optionally narrowed to one reason.
    fn find_open_flags(&self, target: FlagTarget, reason: Option<&str>) -> RepoResult<Vec<Flag>>;
    /// Marks one open flag resolved. Returns `None` when it was not open.
    fn mark_resolved(&self, id: FlagId, resolution: &FlagResolution) -> RepoResult<Option<Flag>>;
    /// Every flag on `target`, oldest first.
    fn list_flags(&self, target: FlagTarget) -> RepoResult<Vec<Flag>>;
    /// Deletes all flags of the given targets and returns how many went.
    fn delete_target_flags(&self, kind: TargetKind, ids: &[Uuid]) -> RepoResult<usize>;
    fn target_exists(&self, target: FlagTarget) -> RepoResult<bool>;
}

/// SQLite-backed flag repository.
pub struct SqliteFlagRepository<'conn> {
    conn: &'conn Connection,
    registry: TargetRegistry,
}

impl<'conn> SqliteFlagRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_registry(conn, TargetRegistry::default())
    }

    pub fn with_registry(conn: &'conn Connection, registry: TargetRegistry) -> Self {
        Self { conn, registry }
    }

    fn query_flags<P: Params>(&self, sql: &str, bindings: P) -> RepoResult<Vec<Flag>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(bindings)?;
        let mut flags = Vec::new();
        while let Some(row) = rows.next()? {
            flags.push(parse_flag_row(row)?);
        }
        Ok(flags)
    }
}

impl FlagRepository for SqliteFlagRepository<'_> {
    fn insert_flag(&self, flag: &NewFlag) -> RepoResult<Flag> {
        self.conn.execute(
            "INSERT INTO flags (
                id,
                target_kind,
                target_id,
                reason,
                reason_type,
                auto_flagged,
                caused_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                flag.id.to_string(),
                flag.target.kind.as_str(),
                flag.target.id.to_string(),
                flag.reason.as_str(),
                flag.reason_type.as_str(),
                bool_to_int(flag.auto_flagged),
                flag.caused_by.map(|value| value.to_string()),
            ],
        )?;
        self.get_flag(flag.id)?
            .ok_or(RepoError::NotFound(EntityRef::Flag(flag.id)))
    }

    fn get_flag(&self, id: FlagId) -> RepoResult<Option<Flag>> {
        let mut flags =
            self.query_flags(&format!("{FLAG_SELECT_SQL} WHERE id = ?1;"), [id.to_string()])?;
        Ok(flags.pop())
    }

    fn find_open_flags(&self, target: FlagTarget, reason: Option<&str>) -> RepoResult<Vec<Flag>> {
        self.query_flags(
            &format!(
                "{FLAG_SELECT_SQL}
                 WHERE target_kind = ?1
                   AND target_id = ?2
                   AND resolved = 0
                   AND (?3 IS NULL OR reason = ?3)
                 ORDER BY created_at ASC, id ASC;"
            ),
            params![target.kind.as_str(), target.id.to_string(), reason],
        )
    }

    fn mark_resolved(&self, id: FlagId, resolution: &FlagResolution) -> RepoResult<Option<Flag>> {
        let changed = self.conn.execute(
            "UPDATE flags
             SET resolved = 1,
                 auto_resolved = ?2,
                 resolved_by = ?3,
                 resolved_reason = ?4,
                 resolved_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1
               AND resolved = 0;",
            params![
                id.to_string(),
                bool_to_int(resolution.auto),
                resolution.resolved_by.map(|value| value.to_string()),
                resolution.note.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_flag(id)
    }

    fn list_flags(&self, target: FlagTarget) -> RepoResult<Vec<Flag>> {
        self.query_flags(
            &format!(
                "{FLAG_SELECT_SQL}
                 WHERE target_kind = ?1
                   AND target_id = ?2
                 ORDER BY created_at ASC, id ASC;"
            ),
            params![target.kind.as_str(), target.id.to_string()],
        )
    }

    fn delete_target_flags(&self, kind: TargetKind, ids: &[Uuid]) -> RepoResult<usize> {
        let mut stmt = self.conn.prepare(
            "DELETE FROM flags
             WHERE target_kind = ?1
               AND target_id = ?2;",
        )?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![kind.as_str(), id.to_string()])?;
        }
        Ok(deleted)
    }

    fn target_exists(&self, target: FlagTarget) -> RepoResult<bool> {
        self.registry.exists(self.conn, target)
    }
}

fn parse_flag_row(row: &Row<'_>) -> RepoResult<Flag> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "flags.id")?;
    let kind_text: String = row.get("target_kind")?;
    let kind = TargetKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid target_kind `{kind_text}` on flag {id}"))
    })?;
    let target_id: String = row.get("target_id")?;
    let reason_type_text: String = row.get("reason_type")?;
    let reason_type = FlagReasonType::parse(&reason_type_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid reason_type `{reason_type_text}` on flag {id}"
        ))
    })?;

    Ok(Flag {
        id,
        target: FlagTarget::new(kind, parse_uuid(&target_id, "flags.target_id")?),
        reason: row.get("reason")?,
        reason_type,
        auto_flagged: parse_bool(row.get("auto_flagged")?, "flags.auto_flagged")?,
        resolved: parse_bool(row.get("resolved")?, "flags.resolved")?,
        auto_resolved: parse_bool(row.get("auto_resolved")?, "flags.auto_resolved")?,
        caused_by: parse_optional_uuid(row.get("caused_by")?, "flags.caused_by")?,
        resolved_by: parse_optional_uuid(row.get("resolved_by")?, "flags.resolved_by")?,
        resolved_reason: row.get("resolved_reason")?,
        created_at: row.get("created_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}
