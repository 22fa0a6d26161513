//! Flag lifecycle service.
//!
//! # Responsibility
//! - Idempotent create/resolve of automatic flags.
//! - Raise and close human flags.
//!
//! # Invariants
//! - `create` never produces a second unresolved flag for the same
//!   (target, reason).
//! - `resolve` only touches auto-raised flags; human flags stay open until a
//!   human closes them through `resolve_manual`.

use crate::model::catalog::{ActorId, EntityRef};
use crate::model::flag::{
    Flag, FlagId, FlagReasonType, FlagResolution, FlagTarget, NewFlag, TargetKind,
};
use crate::repo::flag_repo::FlagRepository;
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Service error for flag use-cases.
#[derive(Debug)]
pub enum FlagServiceError {
    /// Target does not exist according to the target registry.
    UnknownTarget(FlagTarget),
    NotFound(EntityRef),
    /// Flag was already closed.
    AlreadyResolved(FlagId),
    InvalidReason,
    Repo(RepoError),
}

impl Display for FlagServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTarget(target) => write!(f, "flag target not found: {target}"),
            Self::NotFound(entity) => write!(f, "{entity} not found"),
            Self::AlreadyResolved(id) => write!(f, "flag {id} is already resolved"),
            Self::InvalidReason => write!(f, "flag reason cannot be empty"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for FlagServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for FlagServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(entity) => Self::NotFound(entity),
            other => Self::Repo(other),
        }
    }
}

/// Result of one create/resolve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagOutcome {
    Raised(Flag),
    /// An unresolved flag with the same reason already existed.
    AlreadyOpen(Flag),
    Resolved(Flag),
    NothingToResolve,
}

impl FlagOutcome {
    /// Whether the call changed stored flag state.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Raised(_) | Self::Resolved(_))
    }
}

/// Flag service facade over repository implementations.
pub struct FlagService<R: FlagRepository> {
    repo: R,
}

impl<R: FlagRepository> FlagService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Raises an automatic flag unless an identical unresolved one exists.
    pub fn create(
        &self,
        target: FlagTarget,
        reason: &str,
        reason_type: FlagReasonType,
        caused_by: Option<ActorId>,
    ) -> Result<FlagOutcome, FlagServiceError> {
        self.raise(target, reason, reason_type, true, caused_by)
    }

    /// Resolves the unresolved auto-flag with `reason`, if any.
    pub fn resolve(
        &self,
        target: FlagTarget,
        reason: &str,
        resolved_by: Option<ActorId>,
    ) -> Result<FlagOutcome, FlagServiceError> {
        let open = self.repo.find_open_flags(target, Some(reason))?;
        let Some(flag) = open.into_iter().find(|flag| flag.auto_flagged) else {
            return Ok(FlagOutcome::NothingToResolve);
        };

        let resolution = FlagResolution {
            resolved_by,
            auto: true,
            note: None,
        };
        match self.repo.mark_resolved(flag.id, &resolution)? {
            Some(resolved) => Ok(FlagOutcome::Resolved(resolved)),
            None => Ok(FlagOutcome::NothingToResolve),
        }
    }

    /// Raises a human flag. Human flags are never auto-resolved.
    pub fn raise_manual(
        &self,
        target: FlagTarget,
        reason: &str,
        caused_by: ActorId,
    ) -> Result<FlagOutcome, FlagServiceError> {
        self.raise(target, reason, FlagReasonType::Manual, false, Some(caused_by))
    }

    /// Closes any open flag on behalf of a human.
    pub fn resolve_manual(
        &self,
        id: FlagId,
        resolved_by: ActorId,
        note: Option<String>,
    ) -> Result<Flag, FlagServiceError> {
        let flag = self
            .repo
            .get_flag(id)?
            .ok_or(FlagServiceError::NotFound(EntityRef::Flag(id)))?;
        if flag.resolved {
            return Err(FlagServiceError::AlreadyResolved(id));
        }

        let resolution = FlagResolution {
            resolved_by: Some(resolved_by),
            auto: false,
            note: note.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()),
        };
        self.repo
            .mark_resolved(id, &resolution)?
            .ok_or(FlagServiceError::AlreadyResolved(id))
    }

    pub fn open_flags(&self, target: FlagTarget) -> Result<Vec<Flag>, FlagServiceError> {
        Ok(self.repo.find_open_flags(target, None)?)
    }

    /// Full flag history of a target, oldest first.
    pub fn flags_for(&self, target: FlagTarget) -> Result<Vec<Flag>, FlagServiceError> {
        Ok(self.repo.list_flags(target)?)
    }

    /// Drops every flag of targets that are being deleted.
    pub fn purge_targets(&self, kind: TargetKind, ids: &[Uuid]) -> Result<usize, FlagServiceError> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.repo.delete_target_flags(kind, ids)?)
    }

    fn raise(
        &self,
        target: FlagTarget,
        reason: &str,
        reason_type: FlagReasonType,
        auto_flagged: bool,
        caused_by: Option<ActorId>,
    ) -> Result<FlagOutcome, FlagServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(FlagServiceError::InvalidReason);
        }

        if let Some(existing) = self
            .repo
            .find_open_flags(target, Some(reason))?
            .into_iter()
            .next()
        {
            return Ok(FlagOutcome::AlreadyOpen(existing));
        }
        if !self.repo.target_exists(target)? {
            return Err(FlagServiceError::UnknownTarget(target));
        }

        let flag = self.repo.insert_flag(&NewFlag {
            id: Uuid::new_v4(),
            target,
            reason: reason.to_string(),
            reason_type,
            auto_flagged,
            caused_by,
        })?;
        Ok(FlagOutcome::Raised(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::{FlagOutcome, FlagService, FlagServiceError};
    use crate::db::open_db_in_memory;
    use crate::model::catalog::{Indicator, IndicatorCategory, IndicatorType};
    use crate::model::flag::{FlagReasonType, FlagTarget, TargetKind};
    use crate::repo::catalog_repo::{CatalogRepository, SqliteCatalogRepository};
    use crate::repo::flag_repo::SqliteFlagRepository;
    use uuid::Uuid;

    fn indicator_target(conn: &rusqlite::Connection) -> FlagTarget {
        let indicator = Indicator::new(
            "HIV1",
            "Tested",
            IndicatorType::Integer,
            IndicatorCategory::Assessment,
        );
        SqliteCatalogRepository::new(conn)
            .insert_indicator(&indicator)
            .expect("indicator insert");
        FlagTarget::new(TargetKind::Indicator, indicator.id)
    }

    #[test]
    fn create_is_idempotent_per_reason() {
        let conn = open_db_in_memory().expect("open db");
        let target = indicator_target(&conn);
        let service = FlagService::new(SqliteFlagRepository::new(&conn));

        let first = service
            .create(target, "needs review", FlagReasonType::MissingPrerequisite, None)
            .expect("create");
        assert!(matches!(first, FlagOutcome::Raised(_)));
        let second = service
            .create(target, "needs review", FlagReasonType::MissingPrerequisite, None)
            .expect("create again");
        assert!(matches!(second, FlagOutcome::AlreadyOpen(_)));
        service
            .create(target, "another reason", FlagReasonType::ExceedsPrerequisite, None)
            .expect("distinct reason");

        assert_eq!(service.open_flags(target).expect("open").len(), 2);
    }

    #[test]
    fn resolve_skips_human_flags() {
        let conn = open_db_in_memory().expect("open db");
        let target = indicator_target(&conn);
        let service = FlagService::new(SqliteFlagRepository::new(&conn));
        let reviewer = Uuid::new_v4();

        service
            .raise_manual(target, "check source sheet", reviewer)
            .expect("manual flag");
        let outcome = service
            .resolve(target, "check source sheet", None)
            .expect("resolve");
        assert_eq!(outcome, FlagOutcome::NothingToResolve);

        let open = service.open_flags(target).expect("open");
        assert_eq!(open.len(), 1);
        let closed = service
            .resolve_manual(open[0].id, reviewer, Some(" verified ".to_string()))
            .expect("manual resolve");
        assert!(closed.resolved);
        assert!(!closed.auto_resolved);
        assert_eq!(closed.resolved_reason.as_deref(), Some("verified"));

        let again = service.resolve_manual(closed.id, reviewer, None);
        assert!(matches!(again, Err(FlagServiceError::AlreadyResolved(_))));
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let conn = open_db_in_memory().expect("open db");
        let service = FlagService::new(SqliteFlagRepository::new(&conn));
        let missing = FlagTarget::count(Uuid::new_v4());
        let result = service.create(missing, "x", FlagReasonType::MissingPrerequisite, None);
        assert!(matches!(result, Err(FlagServiceError::UnknownTarget(_))));
    }
}
