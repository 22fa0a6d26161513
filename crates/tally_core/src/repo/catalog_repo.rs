//! Catalog repository: reference records owned by collaborators.
//!
//! # Responsibility
//! - Register organizations, projects, indicators, tasks and events.
//! - Answer the lookups the validation gate and evaluator need.
//!
//! # Invariants
//! - Indicator registration writes options, prerequisites and logic
//!   conditions atomically.
//! - Dependency listings are ordered by `(dependent, prerequisite)`.

use crate::model::catalog::{
    Assessment, ConditionKind, Dependency, DependencyOrigin, EntityRef, Event, EventId,
    Indicator, IndicatorCategory, IndicatorId, IndicatorType, LogicCondition, Organization,
    OrganizationId, Project, ProjectId, Task, TaskId,
};
use crate::model::window::DateWindow;
use crate::repo::{
    bool_to_int, date_to_db, parse_bool, parse_date, parse_optional_uuid, parse_uuid,
    placeholders, RepoError, RepoResult,
};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior,
};

/// Repository interface for catalog lookups and registration.
pub trait CatalogRepository {
    fn insert_organization(&self, organization: &Organization) -> RepoResult<()>;
    fn insert_project(&self, project: &Project) -> RepoResult<()>;
    /// Adds (or re-parents) an organization's membership in a project.
    fn link_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
        parent_id: Option<OrganizationId>,
    ) -> RepoResult<()>;
    /// Returns `false` when the organization was not a member.
    fn unlink_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<bool>;
    fn parent_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<Option<OrganizationId>>;
    fn insert_indicator(&self, indicator: &Indicator) -> RepoResult<()>;
    fn get_indicator(&self, id: IndicatorId) -> RepoResult<Option<Indicator>>;
    fn insert_assessment(&self, assessment: &Assessment) -> RepoResult<()>;
    fn insert_task(&self, task: &Task) -> RepoResult<()>;
    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>>;
    /// Whether a task links the triple directly or through its assessment.
    fn has_linked_task(
        &self,
        organization_id: OrganizationId,
        project_id: ProjectId,
        indicator_id: IndicatorId,
    ) -> RepoResult<bool>;
    fn insert_event(&self, event: &Event) -> RepoResult<()>;
    fn get_event(&self, id: EventId) -> RepoResult<Option<Event>>;
    fn attach_task_to_event(&self, event_id: EventId, task_id: TaskId) -> RepoResult<()>;
    /// Returns `false` when the task was not attached.
    fn detach_task_from_event(&self, event_id: EventId, task_id: TaskId) -> RepoResult<bool>;
    fn event_has_task(&self, event_id: EventId, task_id: TaskId) -> RepoResult<bool>;
    /// Every edge with an endpoint in `indicator_ids`.
    fn list_dependencies(&self, indicator_ids: &[IndicatorId]) -> RepoResult<Vec<Dependency>>;
}

/// SQLite-backed catalog repository.
pub struct SqliteCatalogRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteCatalogRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl CatalogRepository for SqliteCatalogRepository<'_> {
    fn insert_organization(&self, organization: &Organization) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO organizations (id, name) VALUES (?1, ?2);",
            params![organization.id.to_string(), organization.name.as_str()],
        )?;
        Ok(())
    }

    fn insert_project(&self, project: &Project) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO projects (id, name) VALUES (?1, ?2);",
            params![project.id.to_string(), project.name.as_str()],
        )?;
        Ok(())
    }

    fn link_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
        parent_id: Option<OrganizationId>,
    ) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO project_organizations (project_id, organization_id, parent_organization_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (project_id, organization_id)
             DO UPDATE SET parent_organization_id = excluded.parent_organization_id;",
            params![
                project_id.to_string(),
                organization_id.to_string(),
                parent_id.map(|value| value.to_string()),
            ],
        )?;
        Ok(())
    }

    fn unlink_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM project_organizations
             WHERE project_id = ?1
               AND organization_id = ?2;",
            params![project_id.to_string(), organization_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn parent_organization(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> RepoResult<Option<OrganizationId>> {
        let parent: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT parent_organization_id
                 FROM project_organizations
                 WHERE project_id = ?1
                   AND organization_id = ?2;",
                params![project_id.to_string(), organization_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        parse_optional_uuid(
            parent.flatten(),
            "project_organizations.parent_organization_id",
        )
    }

    fn insert_indicator(&self, indicator: &Indicator) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO indicators (id, code, name, type, category, allow_aggregate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                indicator.id.to_string(),
                indicator.code.as_str(),
                indicator.name.as_str(),
                indicator.kind.as_str(),
                indicator.category.as_str(),
                bool_to_int(indicator.allow_aggregate),
            ],
        )?;

        for (index, option) in indicator.options.iter().enumerate() {
            tx.execute(
                "INSERT INTO indicator_options (indicator_id, name, sort_order)
                 VALUES (?1, ?2, ?3);",
                params![indicator.id.to_string(), option.as_str(), index as i64],
            )?;
        }

        for prerequisite_id in &indicator.prerequisites {
            tx.execute(
                "INSERT INTO indicator_prerequisites (indicator_id, prerequisite_id)
                 VALUES (?1, ?2);",
                params![indicator.id.to_string(), prerequisite_id.to_string()],
            )?;
        }

        for logic in &indicator.logic {
            let (condition_type, value_boolean, value_number) = condition_to_db(logic.condition);
            tx.execute(
                "INSERT INTO indicator_logic_conditions (
                    indicator_id,
                    source_indicator_id,
                    condition_type,
                    value_boolean,
                    value_number
                 ) VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    indicator.id.to_string(),
                    logic.source_indicator_id.to_string(),
                    condition_type,
                    value_boolean,
                    value_number,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_indicator(&self, id: IndicatorId) -> RepoResult<Option<Indicator>> {
        let row = self
            .conn
            .query_row(
                "SELECT code, name, type, category, allow_aggregate
                 FROM indicators
                 WHERE id = ?1;",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((code, name, type_text, category_text, allow_aggregate)) = row else {
            return Ok(None);
        };

        let kind = IndicatorType::parse(&type_text).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid indicator type `{type_text}` in indicators.type"))
        })?;
        let category = IndicatorCategory::parse(&category_text).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid indicator category `{category_text}` in indicators.category"
            ))
        })?;

        Ok(Some(Indicator {
            id,
            code,
            name,
            kind,
            category,
            allow_aggregate: parse_bool(allow_aggregate, "indicators.allow_aggregate")?,
            options: list_options(self.conn, id)?,
            prerequisites: list_prerequisites(self.conn, id)?,
            logic: list_logic(self.conn, id)?,
        }))
    }

    fn insert_assessment(&self, assessment: &Assessment) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO assessments (id, name) VALUES (?1, ?2);",
            params![assessment.id.to_string(), assessment.name.as_str()],
        )?;
        for indicator_id in &assessment.indicator_ids {
            tx.execute(
                "INSERT INTO assessment_indicators (assessment_id, indicator_id)
                 VALUES (?1, ?2);",
                params![assessment.id.to_string(), indicator_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_task(&self, task: &Task) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO tasks (id, project_id, organization_id, indicator_id, assessment_id)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                task.id.to_string(),
                task.project_id.to_string(),
                task.organization_id.to_string(),
                task.indicator_id.map(|value| value.to_string()),
                task.assessment_id.map(|value| value.to_string()),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT project_id, organization_id, indicator_id, assessment_id
                 FROM tasks
                 WHERE id = ?1;",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((project_id, organization_id, indicator_id, assessment_id)) = row else {
            return Ok(None);
        };

        Ok(Some(Task {
            id,
            project_id: parse_uuid(&project_id, "tasks.project_id")?,
            organization_id: parse_uuid(&organization_id, "tasks.organization_id")?,
            indicator_id: parse_optional_uuid(indicator_id, "tasks.indicator_id")?,
            assessment_id: parse_optional_uuid(assessment_id, "tasks.assessment_id")?,
        }))
    }

    fn has_linked_task(
        &self,
        organization_id: OrganizationId,
        project_id: ProjectId,
        indicator_id: IndicatorId,
    ) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM tasks t
                WHERE t.organization_id = ?1
                  AND t.project_id = ?2
                  AND (
                    t.indicator_id = ?3
                    OR t.assessment_id IN (
                        SELECT assessment_id
                        FROM assessment_indicators
                        WHERE indicator_id = ?3
                    )
                  )
            );",
            params![
                organization_id.to_string(),
                project_id.to_string(),
                indicator_id.to_string(),
            ],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn insert_event(&self, event: &Event) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO events (id, name, organization_id, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                event.id.to_string(),
                event.name.as_str(),
                event.organization_id.to_string(),
                date_to_db(event.window.start),
                date_to_db(event.window.end),
            ],
        )?;
        Ok(())
    }

    fn get_event(&self, id: EventId) -> RepoResult<Option<Event>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, organization_id, start_date, end_date
                 FROM events
                 WHERE id = ?1;",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((name, organization_id, start, end)) = row else {
            return Ok(None);
        };

        let window = DateWindow::new(
            parse_date(&start, "events.start_date")?,
            parse_date(&end, "events.end_date")?,
        )
        .ok_or_else(|| RepoError::InvalidData(format!("inverted window on event {id}")))?;

        Ok(Some(Event {
            id,
            name,
            organization_id: parse_uuid(&organization_id, "events.organization_id")?,
            window,
        }))
    }

    fn attach_task_to_event(&self, event_id: EventId, task_id: TaskId) -> RepoResult<()> {
        if self.get_event(event_id)?.is_none() {
            return Err(RepoError::NotFound(EntityRef::Event(event_id)));
        }
        if self.get_task(task_id)?.is_none() {
            return Err(RepoError::NotFound(EntityRef::Task(task_id)));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO event_tasks (event_id, task_id) VALUES (?1, ?2);",
            params![event_id.to_string(), task_id.to_string()],
        )?;
        Ok(())
    }

    fn detach_task_from_event(&self, event_id: EventId, task_id: TaskId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM event_tasks
             WHERE event_id = ?1
               AND task_id = ?2;",
            params![event_id.to_string(), task_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn event_has_task(&self, event_id: EventId, task_id: TaskId) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM event_tasks
                WHERE event_id = ?1
                  AND task_id = ?2
            );",
            params![event_id.to_string(), task_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn list_dependencies(&self, indicator_ids: &[IndicatorId]) -> RepoResult<Vec<Dependency>> {
        if indicator_ids.is_empty() {
            return Ok(Vec::new());
        }
        let in_list = placeholders(indicator_ids.len());
        let bindings = || {
            indicator_ids
                .iter()
                .chain(indicator_ids.iter())
                .map(|id| id.to_string())
        };

        let mut dependencies = Vec::new();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT indicator_id, prerequisite_id
             FROM indicator_prerequisites
             WHERE indicator_id IN ({in_list})
                OR prerequisite_id IN ({in_list})
             ORDER BY indicator_id ASC, prerequisite_id ASC;"
        ))?;
        let mut rows = stmt.query(params_from_iter(bindings()))?;
        while let Some(row) = rows.next()? {
            let dependent: String = row.get(0)?;
            let prerequisite: String = row.get(1)?;
            dependencies.push(Dependency {
                dependent_id: parse_uuid(&dependent, "indicator_prerequisites.indicator_id")?,
                prerequisite_id: parse_uuid(
                    &prerequisite,
                    "indicator_prerequisites.prerequisite_id",
                )?,
                condition: ConditionKind::Any,
                origin: DependencyOrigin::PrerequisiteList,
            });
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT indicator_id, source_indicator_id, condition_type, value_boolean, value_number
             FROM indicator_logic_conditions
             WHERE indicator_id IN ({in_list})
                OR source_indicator_id IN ({in_list})
             ORDER BY indicator_id ASC, source_indicator_id ASC;"
        ))?;
        let mut rows = stmt.query(params_from_iter(bindings()))?;
        while let Some(row) = rows.next()? {
            let dependent: String = row.get(0)?;
            let source: String = row.get(1)?;
            let condition_type: String = row.get(2)?;
            dependencies.push(Dependency {
                dependent_id: parse_uuid(&dependent, "indicator_logic_conditions.indicator_id")?,
                prerequisite_id: parse_uuid(
                    &source,
                    "indicator_logic_conditions.source_indicator_id",
                )?,
                condition: parse_condition(&condition_type, row.get(3)?, row.get(4)?)?,
                origin: DependencyOrigin::LogicGroup,
            });
        }

        dependencies.sort_by_key(|dependency| (dependency.dependent_id, dependency.prerequisite_id));
        Ok(dependencies)
    }
}

fn list_options(conn: &Connection, id: IndicatorId) -> RepoResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name
         FROM indicator_options
         WHERE indicator_id = ?1
         ORDER BY sort_order ASC, name ASC;",
    )?;
    let mut rows = stmt.query([id.to_string()])?;
    let mut options = Vec::new();
    while let Some(row) = rows.next()? {
        options.push(row.get(0)?);
    }
    Ok(options)
}

fn list_prerequisites(conn: &Connection, id: IndicatorId) -> RepoResult<Vec<IndicatorId>> {
    let mut stmt = conn.prepare(
        "SELECT prerequisite_id
         FROM indicator_prerequisites
         WHERE indicator_id = ?1
         ORDER BY prerequisite_id ASC;",
    )?;
    let mut rows = stmt.query([id.to_string()])?;
    let mut prerequisites = Vec::new();
    while let Some(row) = rows.next()? {
        let value: String = row.get(0)?;
        prerequisites.push(parse_uuid(&value, "indicator_prerequisites.prerequisite_id")?);
    }
    Ok(prerequisites)
}

fn list_logic(conn: &Connection, id: IndicatorId) -> RepoResult<Vec<LogicCondition>> {
    let mut stmt = conn.prepare(
        "SELECT source_indicator_id, condition_type, value_boolean, value_number
         FROM indicator_logic_conditions
         WHERE indicator_id = ?1
         ORDER BY source_indicator_id ASC;",
    )?;
    let mut rows = stmt.query([id.to_string()])?;
    let mut logic = Vec::new();
    while let Some(row) = rows.next()? {
        let source: String = row.get(0)?;
        let condition_type: String = row.get(1)?;
        logic.push(LogicCondition {
            source_indicator_id: parse_uuid(
                &source,
                "indicator_logic_conditions.source_indicator_id",
            )?,
            condition: parse_condition(&condition_type, row.get(2)?, row.get(3)?)?,
        });
    }
    Ok(logic)
}

fn condition_to_db(condition: ConditionKind) -> (&'static str, Option<i64>, Option<i64>) {
    match condition {
        ConditionKind::None => ("none", None, None),
        ConditionKind::Any => ("any", None, None),
        ConditionKind::BooleanEquals(value) => ("equals_bool", Some(bool_to_int(value)), None),
        ConditionKind::NumericBound(bound) => (
            "numeric_bound",
            None,
            Some(i64::try_from(bound).unwrap_or(i64::MAX)),
        ),
    }
}

fn parse_condition(
    condition_type: &str,
    value_boolean: Option<i64>,
    value_number: Option<i64>,
) -> RepoResult<ConditionKind> {
    match (condition_type, value_boolean, value_number) {
        ("none", _, _) => Ok(ConditionKind::None),
        ("any", _, _) => Ok(ConditionKind::Any),
        ("equals_bool", Some(value), _) => Ok(ConditionKind::BooleanEquals(parse_bool(
            value,
            "indicator_logic_conditions.value_boolean",
        )?)),
        ("numeric_bound", _, Some(bound)) if bound >= 0 => {
            Ok(ConditionKind::NumericBound(bound.unsigned_abs()))
        }
        (other, _, _) => Err(RepoError::InvalidData(format!(
            "invalid condition `{other}` in indicator_logic_conditions"
        ))),
    }
}
