//! Count repository.
//!
//! # Responsibility
//! - Persist counts per scope and read them back by scope or time window.
//!
//! # Invariants
//! - `(scope, key_text)` is unique; SQLite partial indexes back this up.
//! - Value updates never touch `created_by` / `created_at`.
//! - Listings are ordered by `key_text ASC` so evaluation order is stable.

use crate::model::catalog::{
    ActorId, EntityRef, EventId, IndicatorId, OrganizationId, ProjectId, TaskId,
};
use crate::model::count::{Breakdown, Count, CountId, CountScope, NewCount};
use crate::model::window::DateWindow;
use crate::repo::{
    bool_to_int, date_to_db, parse_bool, parse_date, parse_optional_uuid, parse_uuid, RepoError,
    RepoResult,
};
use rusqlite::{params, Connection, Row};

const COUNT_SELECT_SQL: &str = "SELECT
    id,
    scope_kind,
    group_id,
    event_id,
    task_id,
    indicator_id,
    organization_id,
    project_id,
    start_date,
    end_date,
    breakdown_json,
    option_name,
    unique_only,
    key_text,
    value,
    created_by,
    created_at,
    updated_by,
    updated_at
FROM counts";

/// Repository interface for count persistence.
pub trait CountRepository {
    fn insert_count(&self, count: &NewCount) -> RepoResult<Count>;
    /// Replaces the value of one count, keeping its creation metadata.
    fn update_count_value(
        &self,
        id: CountId,
        value: u64,
        updated_by: Option<ActorId>,
    ) -> RepoResult<Count>;
    /// Deletes every count of the scope and returns the deleted ids.
    fn delete_scope_counts(&self, scope: &CountScope) -> RepoResult<Vec<CountId>>;
    fn list_scope_counts(&self, scope: &CountScope) -> RepoResult<Vec<Count>>;
    /// Counts of one indicator, organization and project whose window
    /// overlaps `window`, across every scope kind.
    fn list_overlapping_counts(
        &self,
        indicator_id: IndicatorId,
        organization_id: OrganizationId,
        project_id: ProjectId,
        window: DateWindow,
    ) -> RepoResult<Vec<Count>>;
    fn count_task_rows(&self, event_id: EventId, task_id: TaskId) -> RepoResult<u64>;
    fn count_organization_rows(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<u64>;
}

/// SQLite-backed count repository.
pub struct SqliteCountRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteCountRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn load_required(&self, id: CountId) -> RepoResult<Count> {
        let mut stmt = self
            .conn
            .prepare(&format!("{COUNT_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return parse_count_row(row);
        }
        Err(RepoError::NotFound(EntityRef::Count(id)))
    }
}

impl CountRepository for SqliteCountRepository<'_> {
    fn insert_count(&self, count: &NewCount) -> RepoResult<Count> {
        let (scope_kind, group_id, event_id, task_id) = scope_to_db(&count.scope);
        let breakdown_json = serde_json::to_string(&count.breakdown).map_err(|err| {
            RepoError::InvalidData(format!("breakdown cannot be serialized: {err}"))
        })?;

        self.conn.execute(
            "INSERT INTO counts (
                id,
                scope_kind,
                group_id,
                event_id,
                task_id,
                indicator_id,
                organization_id,
                project_id,
                start_date,
                end_date,
                breakdown_json,
                option_name,
                unique_only,
                key_text,
                value,
                created_by,
                updated_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16);",
            params![
                count.id.to_string(),
                scope_kind,
                group_id,
                event_id,
                task_id,
                count.indicator_id.to_string(),
                count.organization_id.to_string(),
                count.project_id.to_string(),
                date_to_db(count.window.start),
                date_to_db(count.window.end),
                breakdown_json,
                count.option.as_deref(),
                bool_to_int(count.unique_only),
                count.key.as_str(),
                value_to_db(count.value)?,
                count.created_by.map(|value| value.to_string()),
            ],
        )?;

        self.load_required(count.id)
    }

    fn update_count_value(
        &self,
        id: CountId,
        value: u64,
        updated_by: Option<ActorId>,
    ) -> RepoResult<Count> {
        let changed = self.conn.execute(
            "UPDATE counts
             SET value = ?2,
                 updated_by = ?3,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                id.to_string(),
                value_to_db(value)?,
                updated_by.map(|value| value.to_string()),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(EntityRef::Count(id)));
        }
        self.load_required(id)
    }

    fn delete_scope_counts(&self, scope: &CountScope) -> RepoResult<Vec<CountId>> {
        let ids: Vec<CountId> = self
            .list_scope_counts(scope)?
            .into_iter()
            .map(|count| count.id)
            .collect();

        match scope {
            CountScope::Group { group_id } => self.conn.execute(
                "DELETE FROM counts
                 WHERE scope_kind = 'group'
                   AND group_id = ?1;",
                [group_id.to_string()],
            )?,
            CountScope::Task { event_id, task_id } => self.conn.execute(
                "DELETE FROM counts
                 WHERE scope_kind = 'task'
                   AND event_id = ?1
                   AND task_id = ?2;",
                params![event_id.to_string(), task_id.to_string()],
            )?,
        };

        Ok(ids)
    }

    fn list_scope_counts(&self, scope: &CountScope) -> RepoResult<Vec<Count>> {
        let mut counts = Vec::new();
        match scope {
            CountScope::Group { group_id } => {
                let mut stmt = self.conn.prepare(&format!(
                    "{COUNT_SELECT_SQL}
                     WHERE scope_kind = 'group'
                       AND group_id = ?1
                     ORDER BY key_text ASC;"
                ))?;
                let mut rows = stmt.query([group_id.to_string()])?;
                while let Some(row) = rows.next()? {
                    counts.push(parse_count_row(row)?);
                }
            }
            CountScope::Task { event_id, task_id } => {
                let mut stmt = self.conn.prepare(&format!(
                    "{COUNT_SELECT_SQL}
                     WHERE scope_kind = 'task'
                       AND event_id = ?1
                       AND task_id = ?2
                     ORDER BY key_text ASC;"
                ))?;
                let mut rows = stmt.query(params![event_id.to_string(), task_id.to_string()])?;
                while let Some(row) = rows.next()? {
                    counts.push(parse_count_row(row)?);
                }
            }
        }
        Ok(counts)
    }

    fn list_overlapping_counts(
        &self,
        indicator_id: IndicatorId,
        organization_id: OrganizationId,
        project_id: ProjectId,
        window: DateWindow,
    ) -> RepoResult<Vec<Count>> {
        let mut stmt = self.conn.prepare(&format!(
            "{COUNT_SELECT_SQL}
             WHERE indicator_id = ?1
               AND organization_id = ?2
               AND project_id = ?3
               AND start_date <= ?5
               AND end_date >= ?4
             ORDER BY start_date ASC, key_text ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![
            indicator_id.to_string(),
            organization_id.to_string(),
            project_id.to_string(),
            date_to_db(window.start),
            date_to_db(window.end),
        ])?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            counts.push(parse_count_row(row)?);
        }
        Ok(counts)
    }

    fn count_task_rows(&self, event_id: EventId, task_id: TaskId) -> RepoResult<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM counts
             WHERE scope_kind = 'task'
               AND event_id = ?1
               AND task_id = ?2;",
            params![event_id.to_string(), task_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(total.unsigned_abs())
    }

    fn count_organization_rows(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM counts
             WHERE project_id = ?1
               AND organization_id = ?2;",
            params![project_id.to_string(), organization_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(total.unsigned_abs())
    }
}

fn scope_to_db(
    scope: &CountScope,
) -> (&'static str, Option<String>, Option<String>, Option<String>) {
    match scope {
        CountScope::Group { group_id } => ("group", Some(group_id.to_string()), None, None),
        CountScope::Task { event_id, task_id } => (
            "task",
            None,
            Some(event_id.to_string()),
            Some(task_id.to_string()),
        ),
    }
}

fn value_to_db(value: u64) -> RepoResult<i64> {
    i64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("count value {value} exceeds storage range")))
}

fn parse_scope(
    kind: &str,
    group_id: Option<String>,
    event_id: Option<String>,
    task_id: Option<String>,
) -> RepoResult<CountScope> {
    match (kind, group_id, event_id, task_id) {
        ("group", Some(group_id), None, None) => Ok(CountScope::Group {
            group_id: parse_uuid(&group_id, "counts.group_id")?,
        }),
        ("task", None, Some(event_id), Some(task_id)) => Ok(CountScope::Task {
            event_id: parse_uuid(&event_id, "counts.event_id")?,
            task_id: parse_uuid(&task_id, "counts.task_id")?,
        }),
        (other, ..) => Err(RepoError::InvalidData(format!(
            "inconsistent scope columns for scope kind `{other}` in counts"
        ))),
    }
}

fn parse_count_row(row: &Row<'_>) -> RepoResult<Count> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "counts.id")?;
    let scope_kind: String = row.get("scope_kind")?;
    let scope = parse_scope(
        &scope_kind,
        row.get("group_id")?,
        row.get("event_id")?,
        row.get("task_id")?,
    )?;

    let start: String = row.get("start_date")?;
    let end: String = row.get("end_date")?;
    let window = DateWindow::new(
        parse_date(&start, "counts.start_date")?,
        parse_date(&end, "counts.end_date")?,
    )
    .ok_or_else(|| RepoError::InvalidData(format!("inverted window on count {id}")))?;

    let breakdown_json: String = row.get("breakdown_json")?;
    let breakdown: Breakdown = serde_json::from_str(&breakdown_json).map_err(|err| {
        RepoError::InvalidData(format!("invalid breakdown_json on count {id}: {err}"))
    })?;

    let value: i64 = row.get("value")?;
    let value = u64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("negative value {value} on count {id}")))?;

    let indicator_id: String = row.get("indicator_id")?;
    let organization_id: String = row.get("organization_id")?;
    let project_id: String = row.get("project_id")?;

    Ok(Count {
        id,
        scope,
        indicator_id: parse_uuid(&indicator_id, "counts.indicator_id")?,
        organization_id: parse_uuid(&organization_id, "counts.organization_id")?,
        project_id: parse_uuid(&project_id, "counts.project_id")?,
        window,
        breakdown,
        option: row.get("option_name")?,
        unique_only: parse_bool(row.get("unique_only")?, "counts.unique_only")?,
        key: row.get("key_text")?,
        value,
        created_by: parse_optional_uuid(row.get("created_by")?, "counts.created_by")?,
        created_at: row.get("created_at")?,
        updated_by: parse_optional_uuid(row.get("updated_by")?, "counts.updated_by")?,
        updated_at: row.get("updated_at")?,
    })
}
