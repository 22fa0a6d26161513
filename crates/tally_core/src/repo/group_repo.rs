//! Aggregate group repository.
//!
//! # Invariants
//! - Groups of one (indicator, project, organization) series never overlap;
//!   the validation gate checks this through `find_overlapping_group`.

use crate::model::catalog::{ActorId, EntityRef, IndicatorId, OrganizationId, ProjectId};
use crate::model::count::{AggregateGroup, GroupId};
use crate::model::window::DateWindow;
use crate::repo::{date_to_db, parse_date, parse_optional_uuid, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

const GROUP_SELECT_SQL: &str = "SELECT
    id,
    indicator_id,
    organization_id,
    project_id,
    start_date,
    end_date,
    created_by,
    created_at,
    updated_by,
    updated_at
FROM aggregate_groups";

/// Repository interface for aggregate groups.
pub trait GroupRepository {
    fn insert_group(&self, group: &AggregateGroup) -> RepoResult<AggregateGroup>;
    fn update_group_window(
        &self,
        id: GroupId,
        window: DateWindow,
        updated_by: Option<ActorId>,
    ) -> RepoResult<AggregateGroup>;
    fn get_group(&self, id: GroupId) -> RepoResult<Option<AggregateGroup>>;
    /// First group of the series overlapping `window`, ignoring `exclude`.
    fn find_overlapping_group(
        &self,
        indicator_id: IndicatorId,
        project_id: ProjectId,
        organization_id: OrganizationId,
        window: DateWindow,
        exclude: Option<GroupId>,
    ) -> RepoResult<Option<AggregateGroup>>;
}

/// SQLite-backed aggregate group repository.
pub struct SqliteGroupRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteGroupRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl GroupRepository for SqliteGroupRepository<'_> {
    fn insert_group(&self, group: &AggregateGroup) -> RepoResult<AggregateGroup> {
        self.conn.execute(
            "INSERT INTO aggregate_groups (
                id,
                indicator_id,
                organization_id,
                project_id,
                start_date,
                end_date,
                created_by,
                updated_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7);",
            params![
                group.id.to_string(),
                group.indicator_id.to_string(),
                group.organization_id.to_string(),
                group.project_id.to_string(),
                date_to_db(group.window.start),
                date_to_db(group.window.end),
                group.created_by.map(|value| value.to_string()),
            ],
        )?;
        load_required_group(self.conn, group.id)
    }

    fn update_group_window(
        &self,
        id: GroupId,
        window: DateWindow,
        updated_by: Option<ActorId>,
    ) -> RepoResult<AggregateGroup> {
        let changed = self.conn.execute(
            "UPDATE aggregate_groups
             SET start_date = ?2,
                 end_date = ?3,
                 updated_by = ?4,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?1;",
            params![
                id.to_string(),
                date_to_db(window.start),
                date_to_db(window.end),
                updated_by.map(|value| value.to_string()),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(EntityRef::Group(id)));
        }
        load_required_group(self.conn, id)
    }

    fn get_group(&self, id: GroupId) -> RepoResult<Option<AggregateGroup>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{GROUP_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_group_row(row)?));
        }
        Ok(None)
    }

    fn find_overlapping_group(
        &self,
        indicator_id: IndicatorId,
        project_id: ProjectId,
        organization_id: OrganizationId,
        window: DateWindow,
        exclude: Option<GroupId>,
    ) -> RepoResult<Option<AggregateGroup>> {
        let mut stmt = self.conn.prepare(&format!(
            "{GROUP_SELECT_SQL}
             WHERE indicator_id = ?1
               AND project_id = ?2
               AND organization_id = ?3
               AND start_date <= ?5
               AND end_date >= ?4
               AND (?6 IS NULL OR id <> ?6)
             ORDER BY start_date ASC, id ASC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query(params![
            indicator_id.to_string(),
            project_id.to_string(),
            organization_id.to_string(),
            date_to_db(window.start),
            date_to_db(window.end),
            exclude.map(|value| value.to_string()),
        ])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_group_row(row)?));
        }
        Ok(None)
    }
}

fn load_required_group(conn: &Connection, id: GroupId) -> RepoResult<AggregateGroup> {
    SqliteGroupRepository::new(conn)
        .get_group(id)?
        .ok_or(RepoError::NotFound(EntityRef::Group(id)))
}

fn parse_group_row(row: &Row<'_>) -> RepoResult<AggregateGroup> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "aggregate_groups.id")?;
    let indicator_id: String = row.get("indicator_id")?;
    let organization_id: String = row.get("organization_id")?;
    let project_id: String = row.get("project_id")?;
    let start: String = row.get("start_date")?;
    let end: String = row.get("end_date")?;

    let window = DateWindow::new(
        parse_date(&start, "aggregate_groups.start_date")?,
        parse_date(&end, "aggregate_groups.end_date")?,
    )
    .ok_or_else(|| RepoError::InvalidData(format!("inverted window on aggregate group {id}")))?;

    Ok(AggregateGroup {
        id,
        indicator_id: parse_uuid(&indicator_id, "aggregate_groups.indicator_id")?,
        organization_id: parse_uuid(&organization_id, "aggregate_groups.organization_id")?,
        project_id: parse_uuid(&project_id, "aggregate_groups.project_id")?,
        window,
        created_by: parse_optional_uuid(row.get("created_by")?, "aggregate_groups.created_by")?,
        created_at: row.get("created_at")?,
        updated_by: parse_optional_uuid(row.get("updated_by")?, "aggregate_groups.updated_by")?,
        updated_at: row.get("updated_at")?,
    })
}
