#![allow(dead_code)]

use chrono::NaiveDate;
use rusqlite::Connection;
use tally_core::db::open_db_in_memory;
use tally_core::model::catalog::{
    Actor, ConditionKind, Event, Indicator, IndicatorCategory, IndicatorId, IndicatorType,
    LogicCondition, Organization, OrganizationId, Project, ProjectId, Role, Task,
};
use tally_core::model::window::DateWindow;
use tally_core::repo::catalog_repo::{CatalogRepository, SqliteCatalogRepository};
use tally_core::SubmissionService;
use uuid::Uuid;

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn window(start: NaiveDate, end: NaiveDate) -> DateWindow {
    DateWindow::new(start, end).unwrap()
}

/// Fixed "today" every service in the tests runs with.
pub fn today() -> NaiveDate {
    day(2024, 12, 31)
}

/// One project with a reporting organization, its parent and an outsider.
pub struct World {
    pub conn: Connection,
    pub project_id: ProjectId,
    pub organization_id: OrganizationId,
    pub parent_id: OrganizationId,
    pub outsider_id: OrganizationId,
}

impl World {
    pub fn new() -> Self {
        let conn = open_db_in_memory().unwrap();
        let project_id = Uuid::new_v4();
        let organization_id = Uuid::new_v4();
        let parent_id = Uuid::new_v4();
        let outsider_id = Uuid::new_v4();
        {
            let catalog = SqliteCatalogRepository::new(&conn);
            catalog
                .insert_project(&Project {
                    id: project_id,
                    name: "Outreach 2024".to_string(),
                })
                .unwrap();
            for (id, name) in [
                (organization_id, "Clinic North"),
                (parent_id, "Health Network"),
                (outsider_id, "Unrelated Org"),
            ] {
                catalog
                    .insert_organization(&Organization {
                        id,
                        name: name.to_string(),
                    })
                    .unwrap();
            }
            catalog
                .link_organization(project_id, parent_id, None)
                .unwrap();
            catalog
                .link_organization(project_id, organization_id, Some(parent_id))
                .unwrap();
            catalog
                .link_organization(project_id, outsider_id, None)
                .unwrap();
        }
        Self {
            conn,
            project_id,
            organization_id,
            parent_id,
            outsider_id,
        }
    }

    pub fn catalog(&self) -> SqliteCatalogRepository<'_> {
        SqliteCatalogRepository::new(&self.conn)
    }

    pub fn service(&self) -> SubmissionService<'_> {
        SubmissionService::with_today(&self.conn, today())
    }

    pub fn actor(&self, role: Role) -> Actor {
        self.actor_of(role, self.organization_id)
    }

    pub fn actor_of(&self, role: Role, organization_id: OrganizationId) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            role,
            organization_id,
        }
    }

    /// Registers an aggregatable assessment indicator.
    pub fn indicator(&self, code: &str, kind: IndicatorType) -> Indicator {
        self.indicator_with(code, kind, &[], &[], &[])
    }

    pub fn indicator_with(
        &self,
        code: &str,
        kind: IndicatorType,
        options: &[&str],
        prerequisites: &[IndicatorId],
        logic: &[(IndicatorId, ConditionKind)],
    ) -> Indicator {
        let mut indicator = Indicator::new(
            code,
            format!("Indicator {code}"),
            kind,
            IndicatorCategory::Assessment,
        );
        indicator.allow_aggregate = true;
        indicator.options = options.iter().map(|option| option.to_string()).collect();
        indicator.prerequisites = prerequisites.to_vec();
        indicator.logic = logic
            .iter()
            .map(|(source_indicator_id, condition)| LogicCondition {
                source_indicator_id: *source_indicator_id,
                condition: *condition,
            })
            .collect();
        self.catalog().insert_indicator(&indicator).unwrap();
        indicator
    }

    /// Assigns the indicator to the reporting organization.
    pub fn task(&self, indicator_id: IndicatorId) -> Task {
        self.task_for(indicator_id, self.organization_id)
    }

    pub fn task_for(&self, indicator_id: IndicatorId, organization_id: OrganizationId) -> Task {
        let task = Task {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            organization_id,
            indicator_id: Some(indicator_id),
            assessment_id: None,
        };
        self.catalog().insert_task(&task).unwrap();
        task
    }

    /// Creates an event hosting the given tasks.
    pub fn event(&self, window: DateWindow, tasks: &[&Task]) -> Event {
        let event = Event {
            id: Uuid::new_v4(),
            name: "Testing drive".to_string(),
            organization_id: self.organization_id,
            window,
        };
        let catalog = self.catalog();
        catalog.insert_event(&event).unwrap();
        for task in tasks {
            catalog.attach_task_to_event(event.id, task.id).unwrap();
        }
        event
    }

    pub fn table_count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
                row.get(0)
            })
            .unwrap()
    }
}
