//! Count submission service.
//!
//! # Responsibility
//! - Accept aggregate-group and event/task count batches.
//! - Persist them with the scope's write strategy: wholesale replace for
//!   aggregate groups, schema-aware upsert for event/task counts.
//! - Converge dependency flags inline with the write.
//!
//! # Invariants
//! - One submission is one `IMMEDIATE` transaction; any error rolls back
//!   validation reads, count writes and flag changes together.
//! - Every row of a batch is validated before the first write to its scope;
//!   upsert batches are bound-checked against the merged stored state.
//! - Flags on counts deleted by a replace are purged in the same transaction.

use crate::breakdown::schema::BreakdownSchema;
use crate::model::catalog::{
    Actor, ActorId, EntityRef, EventId, Indicator, IndicatorId, OrganizationId, ProjectId, TaskId,
};
use crate::model::count::{AggregateGroup, BreakdownRow, Count, CountScope, GroupId, NewCount};
use crate::model::flag::{Flag, FlagDelta, FlagTarget, TargetKind};
use crate::model::window::DateWindow;
use crate::repo::catalog_repo::{CatalogRepository, SqliteCatalogRepository};
use crate::repo::count_repo::{CountRepository, SqliteCountRepository};
use crate::repo::flag_repo::{FlagRepository, SqliteFlagRepository};
use crate::repo::group_repo::{GroupRepository, SqliteGroupRepository};
use crate::repo::RepoError;
use crate::service::dependency_service::{DependencyEvaluator, DependencyGraph};
use crate::service::flag_service::{FlagService, FlagServiceError};
use crate::service::validation::{
    check_authority, check_merged_totals, prepare_upsert_rows, GateError, GroupGate,
    GroupTarget, PermissionError, PreparedBatch, PreparedRow, ValidationError, ValidationRule,
};
use chrono::NaiveDate;
use log::{error, info};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

/// Service error for count submissions.
#[derive(Debug)]
pub enum SubmissionError {
    /// Actor lacks authority; reported apart from input errors.
    Permission(PermissionError),
    /// Aggregate-group batch failed a gate rule.
    Validation(ValidationError),
    /// One task's rows failed validation.
    TaskBreakdown {
        task_id: TaskId,
        error: ValidationError,
    },
    /// Task cannot take counts in this event.
    InvalidTask {
        event_id: EventId,
        task_id: TaskId,
        detail: String,
    },
    NotFound(EntityRef),
    Flag(FlagServiceError),
    Repo(RepoError),
}

impl SubmissionError {
    /// Stable machine code for logs and collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Permission(_) => "permission_denied",
            Self::Validation(_) => "validation_failed",
            Self::TaskBreakdown { .. } => "task_breakdown_invalid",
            Self::InvalidTask { .. } => "invalid_task",
            Self::NotFound(_) => "not_found",
            Self::Flag(_) => "flag_failed",
            Self::Repo(_) => "storage_failed",
        }
    }

    /// HTTP-style status for transports fronting the engine.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Permission(_) => 403,
            Self::Validation(_) | Self::TaskBreakdown { .. } | Self::InvalidTask { .. } => 400,
            Self::NotFound(_) => 404,
            Self::Flag(_) | Self::Repo(_) => 500,
        }
    }
}

impl Display for SubmissionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permission(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::TaskBreakdown { task_id, error } => write!(f, "task {task_id}: {error}"),
            Self::InvalidTask {
                event_id,
                task_id,
                detail,
            } => write!(f, "task {task_id} in event {event_id}: {detail}"),
            Self::NotFound(entity) => write!(f, "{entity} not found"),
            Self::Flag(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SubmissionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Permission(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::TaskBreakdown { error, .. } => Some(error),
            Self::Flag(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::InvalidTask { .. } | Self::NotFound(_) => None,
        }
    }
}

impl From<RepoError> for SubmissionError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(entity) => Self::NotFound(entity),
            other => Self::Repo(other),
        }
    }
}

impl From<rusqlite::Error> for SubmissionError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

impl From<FlagServiceError> for SubmissionError {
    fn from(value: FlagServiceError) -> Self {
        match value {
            FlagServiceError::Repo(err) => Self::Repo(err),
            FlagServiceError::NotFound(entity) => Self::NotFound(entity),
            other => Self::Flag(other),
        }
    }
}

impl From<GateError> for SubmissionError {
    fn from(value: GateError) -> Self {
        match value {
            GateError::Permission(err) => Self::Permission(err),
            GateError::Validation(err) => Self::Validation(err),
            GateError::NotFound(entity) => Self::NotFound(entity),
            GateError::Repo(err) => Self::Repo(err),
        }
    }
}

/// Aggregate-group submission. `group_id` is set when editing a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSubmission {
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub rows: Vec<BreakdownRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSubmissionResult {
    pub group: AggregateGroup,
    pub counts: Vec<Count>,
    /// Rows accepted with a blank or zero value.
    pub skipped: usize,
    pub flags: FlagDelta,
}

/// Rows for one task of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCountBatch {
    pub task_id: TaskId,
    #[serde(default)]
    pub rows: Vec<BreakdownRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCountSubmission {
    pub event_id: EventId,
    pub tasks: Vec<TaskCountBatch>,
}

/// What one task's upsert did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCountOutcome {
    pub task_id: TaskId,
    /// Stored schema differed, so prior counts were replaced.
    pub schema_replaced: bool,
    pub removed: usize,
    pub created: Vec<Count>,
    pub updated: Vec<Count>,
    pub unchanged: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCountsResult {
    pub event_id: EventId,
    pub tasks: Vec<TaskCountOutcome>,
    pub flags: FlagDelta,
}

/// Denormalized attributes shared by every count of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeContext {
    pub scope: CountScope,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub window: DateWindow,
}

impl ScopeContext {
    fn new_count(
        &self,
        row: &PreparedRow,
        value: u64,
        actor: Option<ActorId>,
    ) -> NewCount {
        NewCount {
            id: Uuid::new_v4(),
            scope: self.scope,
            indicator_id: self.indicator_id,
            organization_id: self.organization_id,
            project_id: self.project_id,
            window: self.window,
            breakdown: row.breakdown.clone(),
            option: row.option.clone(),
            unique_only: row.unique_only,
            key: row.key.to_storage(),
            value,
            created_by: actor,
        }
    }
}

/// Result of a wholesale scope replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub removed: usize,
    pub created: Vec<Count>,
}

/// Result of a schema-aware upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub schema_replaced: bool,
    pub removed: usize,
    pub created: Vec<Count>,
    pub updated: Vec<Count>,
    pub unchanged: Vec<Count>,
}

impl UpsertOutcome {
    /// Counts the evaluator has to look at after the upsert.
    pub fn touched(&self) -> impl Iterator<Item = &Count> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .chain(self.unchanged.iter())
    }
}

/// Deletes every count of the scope with its flags and inserts the batch.
pub fn replace_group_counts<K: CountRepository, F: FlagRepository>(
    counts: &K,
    flags: &FlagService<F>,
    context: &ScopeContext,
    batch: &PreparedBatch,
    actor: Option<ActorId>,
) -> Result<ReplaceOutcome, SubmissionError> {
    replace_scope(counts, flags, context, batch, actor)
}

/// Upserts one task's counts by composite key.
///
/// When the stored schema differs from the batch schema the task's counts
/// are replaced wholesale instead. Stored counts the batch does not mention
/// are left alone; identical values are not rewritten. Option rows are
/// bound-checked against the totals the scope holds after the merge, before
/// anything is written.
pub fn upsert_task_counts<K: CountRepository, F: FlagRepository>(
    counts: &K,
    flags: &FlagService<F>,
    context: &ScopeContext,
    batch: &PreparedBatch,
    actor: Option<ActorId>,
) -> Result<UpsertOutcome, SubmissionError> {
    let stored = counts.list_scope_counts(&context.scope)?;
    let stored_schema = BreakdownSchema::from_stored(stored.iter().map(|count| &count.breakdown));
    let replaces = !stored.is_empty() && stored_schema != batch.schema;

    let merged_over = if replaces { &[][..] } else { &stored[..] };
    check_merged_totals(batch, merged_over).map_err(|error| rejected(context.scope, error))?;

    if replaces {
        let replaced = replace_scope(counts, flags, context, batch, actor)?;
        return Ok(UpsertOutcome {
            schema_replaced: true,
            removed: replaced.removed,
            created: replaced.created,
            ..UpsertOutcome::default()
        });
    }

    let by_key: HashMap<&str, &Count> = stored
        .iter()
        .map(|count| (count.key.as_str(), count))
        .collect();
    let mut outcome = UpsertOutcome::default();
    for row in batch.persistable() {
        let Some(value) = row.value else {
            continue;
        };
        let key = row.key.to_storage();
        match by_key.get(key.as_str()) {
            Some(existing) if existing.value == value => {
                outcome.unchanged.push((*existing).clone());
            }
            Some(existing) => {
                outcome
                    .updated
                    .push(counts.update_count_value(existing.id, value, actor)?);
            }
            None => {
                outcome
                    .created
                    .push(counts.insert_count(&context.new_count(row, value, actor))?);
            }
        }
    }
    Ok(outcome)
}

fn rejected(scope: CountScope, error: ValidationError) -> SubmissionError {
    match scope {
        CountScope::Task { task_id, .. } => SubmissionError::TaskBreakdown { task_id, error },
        CountScope::Group { .. } => SubmissionError::Validation(error),
    }
}

fn replace_scope<K: CountRepository, F: FlagRepository>(
    counts: &K,
    flags: &FlagService<F>,
    context: &ScopeContext,
    batch: &PreparedBatch,
    actor: Option<ActorId>,
) -> Result<ReplaceOutcome, SubmissionError> {
    let removed = counts.delete_scope_counts(&context.scope)?;
    flags.purge_targets(TargetKind::Count, &removed)?;

    let mut created = Vec::new();
    for row in batch.persistable() {
        let Some(value) = row.value else {
            continue;
        };
        created.push(counts.insert_count(&context.new_count(row, value, actor))?);
    }
    Ok(ReplaceOutcome {
        removed: removed.len(),
        created,
    })
}

struct PreparedTask {
    task_id: TaskId,
    context: ScopeContext,
    batch: PreparedBatch,
}

/// Count submission facade over one SQLite connection.
pub struct SubmissionService<'conn> {
    conn: &'conn Connection,
    today: NaiveDate,
}

impl<'conn> SubmissionService<'conn> {
    /// Creates a service that dates checks against the local calendar.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_today(conn, chrono::Local::now().date_naive())
    }

    /// Creates a service with a fixed "today".
    pub fn with_today(conn: &'conn Connection, today: NaiveDate) -> Self {
        Self { conn, today }
    }

    /// Validates and stores one aggregate group, replacing its counts.
    pub fn submit_group(
        &self,
        actor: &Actor,
        submission: &GroupSubmission,
    ) -> Result<GroupSubmissionResult, SubmissionError> {
        let started_at = Instant::now();
        info!(
            "event=submit_group module=submission status=start rows={} edit={}",
            submission.rows.len(),
            submission.group_id.is_some()
        );
        let result = self.submit_group_in_tx(actor, submission);
        match &result {
            Ok(outcome) => info!(
                "event=submit_group module=submission status=ok group_id={} counts={} skipped={} flags_raised={} flags_resolved={} duration_ms={}",
                outcome.group.id,
                outcome.counts.len(),
                outcome.skipped,
                outcome.flags.raised.len(),
                outcome.flags.resolved.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=submit_group module=submission status=error error_code={} duration_ms={}",
                err.code(),
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    /// Validates and upserts the counts of several tasks in one event.
    pub fn submit_task_counts(
        &self,
        actor: &Actor,
        submission: &TaskCountSubmission,
    ) -> Result<TaskCountsResult, SubmissionError> {
        let started_at = Instant::now();
        info!(
            "event=submit_task_counts module=submission status=start event_id={} tasks={}",
            submission.event_id,
            submission.tasks.len()
        );
        let result = self.submit_task_counts_in_tx(actor, submission);
        match &result {
            Ok(outcome) => info!(
                "event=submit_task_counts module=submission status=ok event_id={} tasks={} flags_raised={} flags_resolved={} duration_ms={}",
                outcome.event_id,
                outcome.tasks.len(),
                outcome.flags.raised.len(),
                outcome.flags.resolved.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=submit_task_counts module=submission status=error event_id={} error_code={} duration_ms={}",
                submission.event_id,
                err.code(),
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    /// Re-runs dependency evaluation for an existing scope without writing
    /// counts.
    pub fn reevaluate(&self, scope: CountScope) -> Result<FlagDelta, SubmissionError> {
        let started_at = Instant::now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let delta = {
            let catalog = SqliteCatalogRepository::new(&tx);
            let counts = SqliteCountRepository::new(&tx);
            let flags = FlagService::new(SqliteFlagRepository::new(&tx));
            let context = self.scope_context(&tx, &catalog, scope)?;

            let stored = counts.list_scope_counts(&scope)?;
            let graph = DependencyGraph::load(&catalog, &[context.indicator_id])?;
            let mut evaluator = DependencyEvaluator::new(&graph, &counts, &flags, None);
            let mut delta = evaluator.evaluate_persisted(&stored)?;
            delta.merge(evaluator.propagate_downstream(
                context.indicator_id,
                context.organization_id,
                context.project_id,
                context.window,
            )?);
            delta
        };
        tx.commit()?;
        info!(
            "event=reevaluate module=submission status=ok scope={} flags_raised={} flags_resolved={} duration_ms={}",
            scope,
            delta.raised.len(),
            delta.resolved.len(),
            started_at.elapsed().as_millis()
        );
        Ok(delta)
    }

    /// Stored counts of one aggregate group, ordered by key.
    pub fn group_counts(&self, group_id: GroupId) -> Result<Vec<Count>, SubmissionError> {
        if SqliteGroupRepository::new(self.conn)
            .get_group(group_id)?
            .is_none()
        {
            return Err(SubmissionError::NotFound(EntityRef::Group(group_id)));
        }
        Ok(SqliteCountRepository::new(self.conn)
            .list_scope_counts(&CountScope::Group { group_id })?)
    }

    /// Stored counts of one task in one event, ordered by key.
    pub fn task_counts(
        &self,
        event_id: EventId,
        task_id: TaskId,
    ) -> Result<Vec<Count>, SubmissionError> {
        Ok(SqliteCountRepository::new(self.conn)
            .list_scope_counts(&CountScope::Task { event_id, task_id })?)
    }

    /// Full flag history of one target.
    pub fn flags_for(&self, target: FlagTarget) -> Result<Vec<Flag>, SubmissionError> {
        Ok(FlagService::new(SqliteFlagRepository::new(self.conn)).flags_for(target)?)
    }

    fn submit_group_in_tx(
        &self,
        actor: &Actor,
        submission: &GroupSubmission,
    ) -> Result<GroupSubmissionResult, SubmissionError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let result = {
            let catalog = SqliteCatalogRepository::new(&tx);
            let groups = SqliteGroupRepository::new(&tx);
            let counts = SqliteCountRepository::new(&tx);
            let flags = FlagService::new(SqliteFlagRepository::new(&tx));

            let target = GroupTarget {
                group_id: submission.group_id,
                indicator_id: submission.indicator_id,
                organization_id: submission.organization_id,
                project_id: submission.project_id,
                start: submission.start,
                end: submission.end,
            };
            let gate = GroupGate::new(&catalog, &groups, self.today).check(
                actor,
                &target,
                &submission.rows,
            )?;

            let previous_window = gate.existing.as_ref().map(|group| group.window);
            let group = match &gate.existing {
                Some(existing) => {
                    groups.update_group_window(existing.id, gate.window, Some(actor.id))?
                }
                None => groups.insert_group(&AggregateGroup {
                    id: Uuid::new_v4(),
                    indicator_id: submission.indicator_id,
                    organization_id: submission.organization_id,
                    project_id: submission.project_id,
                    window: gate.window,
                    created_by: Some(actor.id),
                    created_at: 0,
                    updated_by: Some(actor.id),
                    updated_at: 0,
                })?,
            };

            let context = ScopeContext {
                scope: CountScope::Group { group_id: group.id },
                indicator_id: group.indicator_id,
                organization_id: group.organization_id,
                project_id: group.project_id,
                window: group.window,
            };
            let replaced =
                replace_group_counts(&counts, &flags, &context, &gate.batch, Some(actor.id))?;

            let graph = DependencyGraph::load(&catalog, &[gate.indicator.id])?;
            let mut evaluator = DependencyEvaluator::new(&graph, &counts, &flags, Some(actor.id));
            let mut delta = evaluator.evaluate_persisted(&replaced.created)?;
            let mut windows = vec![group.window];
            if let Some(previous) = previous_window.filter(|window| *window != group.window) {
                windows.push(previous);
            }
            for window in windows {
                delta.merge(evaluator.propagate_downstream(
                    gate.indicator.id,
                    group.organization_id,
                    group.project_id,
                    window,
                )?);
            }

            GroupSubmissionResult {
                group,
                counts: replaced.created,
                skipped: gate.batch.skipped(),
                flags: delta,
            }
        };
        tx.commit()?;
        Ok(result)
    }

    fn submit_task_counts_in_tx(
        &self,
        actor: &Actor,
        submission: &TaskCountSubmission,
    ) -> Result<TaskCountsResult, SubmissionError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let result = {
            let catalog = SqliteCatalogRepository::new(&tx);
            let counts = SqliteCountRepository::new(&tx);
            let flags = FlagService::new(SqliteFlagRepository::new(&tx));

            let event = catalog
                .get_event(submission.event_id)?
                .ok_or(SubmissionError::NotFound(EntityRef::Event(
                    submission.event_id,
                )))?;

            let mut prepared = Vec::with_capacity(submission.tasks.len());
            let mut seen = HashSet::new();
            for task_batch in &submission.tasks {
                if !seen.insert(task_batch.task_id) {
                    return Err(SubmissionError::InvalidTask {
                        event_id: event.id,
                        task_id: task_batch.task_id,
                        detail: "task appears more than once in the batch".to_string(),
                    });
                }
                prepared.push(self.prepare_task(
                    &catalog,
                    actor,
                    event.id,
                    event.window,
                    task_batch,
                )?);
            }

            let mut outcomes = Vec::with_capacity(prepared.len());
            let mut touched = Vec::new();
            for task in &prepared {
                let upserted = upsert_task_counts(
                    &counts,
                    &flags,
                    &task.context,
                    &task.batch,
                    Some(actor.id),
                )?;
                touched.extend(upserted.touched().cloned());
                outcomes.push(TaskCountOutcome {
                    task_id: task.task_id,
                    schema_replaced: upserted.schema_replaced,
                    removed: upserted.removed,
                    unchanged: upserted.unchanged.len(),
                    skipped: task.batch.skipped(),
                    created: upserted.created,
                    updated: upserted.updated,
                });
            }

            let roots: Vec<IndicatorId> = prepared
                .iter()
                .map(|task| task.context.indicator_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let graph = DependencyGraph::load(&catalog, &roots)?;
            let mut evaluator = DependencyEvaluator::new(&graph, &counts, &flags, Some(actor.id));
            let mut delta = evaluator.evaluate_persisted(&touched)?;

            let series: BTreeSet<(IndicatorId, OrganizationId, ProjectId)> = prepared
                .iter()
                .map(|task| {
                    (
                        task.context.indicator_id,
                        task.context.organization_id,
                        task.context.project_id,
                    )
                })
                .collect();
            for (indicator_id, organization_id, project_id) in series {
                delta.merge(evaluator.propagate_downstream(
                    indicator_id,
                    organization_id,
                    project_id,
                    event.window,
                )?);
            }

            TaskCountsResult {
                event_id: event.id,
                tasks: outcomes,
                flags: delta,
            }
        };
        tx.commit()?;
        Ok(result)
    }

    fn prepare_task<C: CatalogRepository>(
        &self,
        catalog: &C,
        actor: &Actor,
        event_id: EventId,
        window: DateWindow,
        task_batch: &TaskCountBatch,
    ) -> Result<PreparedTask, SubmissionError> {
        let task_id = task_batch.task_id;
        let invalid = |detail: &str| SubmissionError::InvalidTask {
            event_id,
            task_id,
            detail: detail.to_string(),
        };

        let task = catalog
            .get_task(task_id)?
            .ok_or(SubmissionError::NotFound(EntityRef::Task(task_id)))?;
        if !catalog.event_has_task(event_id, task_id)? {
            return Err(invalid("task is not attached to the event"));
        }
        let indicator_id = task
            .indicator_id
            .ok_or_else(|| invalid("task has no indicator to count"))?;

        let parent = catalog.parent_organization(task.project_id, task.organization_id)?;
        check_authority(actor, task.organization_id, task.project_id, parent)
            .map_err(SubmissionError::Permission)?;

        let indicator: Indicator = catalog
            .get_indicator(indicator_id)?
            .ok_or(SubmissionError::NotFound(EntityRef::Indicator(indicator_id)))?;
        if !indicator.kind.is_countable() {
            return Err(SubmissionError::TaskBreakdown {
                task_id,
                error: ValidationError::batch(
                    ValidationRule::IndicatorNotCountable,
                    format!("{} does not take counts", indicator.code),
                ),
            });
        }

        let batch = prepare_upsert_rows(&indicator, &task_batch.rows)
            .map_err(|error| SubmissionError::TaskBreakdown { task_id, error })?;

        Ok(PreparedTask {
            task_id,
            context: ScopeContext {
                scope: CountScope::Task { event_id, task_id },
                indicator_id,
                organization_id: task.organization_id,
                project_id: task.project_id,
                window,
            },
            batch,
        })
    }

    fn scope_context<C: CatalogRepository>(
        &self,
        conn: &Connection,
        catalog: &C,
        scope: CountScope,
    ) -> Result<ScopeContext, SubmissionError> {
        match scope {
            CountScope::Group { group_id } => {
                let group = SqliteGroupRepository::new(conn)
                    .get_group(group_id)?
                    .ok_or(SubmissionError::NotFound(EntityRef::Group(group_id)))?;
                Ok(ScopeContext {
                    scope,
                    indicator_id: group.indicator_id,
                    organization_id: group.organization_id,
                    project_id: group.project_id,
                    window: group.window,
                })
            }
            CountScope::Task { event_id, task_id } => {
                let event = catalog
                    .get_event(event_id)?
                    .ok_or(SubmissionError::NotFound(EntityRef::Event(event_id)))?;
                let task = catalog
                    .get_task(task_id)?
                    .ok_or(SubmissionError::NotFound(EntityRef::Task(task_id)))?;
                let indicator_id = task.indicator_id.ok_or(SubmissionError::InvalidTask {
                    event_id,
                    task_id,
                    detail: "task has no indicator to count".to_string(),
                })?;
                Ok(ScopeContext {
                    scope,
                    indicator_id,
                    organization_id: task.organization_id,
                    project_id: task.project_id,
                    window: event.window,
                })
            }
        }
    }
}
