//! Catalog link maintenance guarded by stored counts.
//!
//! # Invariants
//! - An organization is never detached from a project while counts exist
//!   for that pair.
//! - A task is never detached from an event while it owns counts there.

use crate::model::catalog::{EntityRef, EventId, OrganizationId, ProjectId, TaskId};
use crate::repo::catalog_repo::CatalogRepository;
use crate::repo::count_repo::CountRepository;
use crate::repo::RepoError;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Service error for catalog link maintenance.
#[derive(Debug)]
pub enum CatalogServiceError {
    /// Dependent counts still exist.
    Conflict {
        entity: EntityRef,
        owner: EntityRef,
        counts: u64,
    },
    /// Link to remove does not exist.
    NotLinked {
        entity: EntityRef,
        owner: EntityRef,
    },
    Repo(RepoError),
}

impl Display for CatalogServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict {
                entity,
                owner,
                counts,
            } => write!(
                f,
                "cannot detach {entity} from {owner}: {counts} count(s) depend on it"
            ),
            Self::NotLinked { entity, owner } => write!(f, "{entity} is not linked to {owner}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CatalogServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for CatalogServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Catalog service facade over repository implementations.
pub struct CatalogService<C: CatalogRepository, K: CountRepository> {
    catalog: C,
    counts: K,
}

impl<C: CatalogRepository, K: CountRepository> CatalogService<C, K> {
    pub fn new(catalog: C, counts: K) -> Self {
        Self { catalog, counts }
    }

    /// Removes a task from an event unless it owns counts there.
    pub fn detach_task_from_event(
        &self,
        event_id: EventId,
        task_id: TaskId,
    ) -> Result<(), CatalogServiceError> {
        let entity = EntityRef::Task(task_id);
        let owner = EntityRef::Event(event_id);
        let counts = self.counts.count_task_rows(event_id, task_id)?;
        if counts > 0 {
            warn!(
                "event=detach_task module=catalog status=error error_code=conflict counts={}",
                counts
            );
            return Err(CatalogServiceError::Conflict {
                entity,
                owner,
                counts,
            });
        }
        if !self.catalog.detach_task_from_event(event_id, task_id)? {
            return Err(CatalogServiceError::NotLinked { entity, owner });
        }
        info!("event=detach_task module=catalog status=ok");
        Ok(())
    }

    /// Removes an organization from a project unless counts exist for it.
    pub fn detach_organization_from_project(
        &self,
        project_id: ProjectId,
        organization_id: OrganizationId,
    ) -> Result<(), CatalogServiceError> {
        let entity = EntityRef::Organization(organization_id);
        let owner = EntityRef::Project(project_id);
        let counts = self
            .counts
            .count_organization_rows(project_id, organization_id)?;
        if counts > 0 {
            warn!(
                "event=detach_organization module=catalog status=error error_code=conflict counts={}",
                counts
            );
            return Err(CatalogServiceError::Conflict {
                entity,
                owner,
                counts,
            });
        }
        if !self.catalog.unlink_organization(project_id, organization_id)? {
            return Err(CatalogServiceError::NotLinked { entity, owner });
        }
        info!("event=detach_organization module=catalog status=ok");
        Ok(())
    }
}
