mod common;

use common::{day, World};
use rusqlite::Connection;
use tally_core::model::catalog::{IndicatorType, Role};
use tally_core::model::count::BreakdownRow;
use tally_core::model::flag::{FlagReasonType, FlagTarget, TargetKind};
use tally_core::repo::flag_repo::{SqliteFlagRepository, TargetRegistry};
use tally_core::repo::RepoError;
use tally_core::service::dependency_service::missing_reason;
use tally_core::service::flag_service::{FlagOutcome, FlagService, FlagServiceError};
use tally_core::{GroupSubmission, GroupSubmissionResult};
use uuid::Uuid;

fn submit(
    world: &World,
    group_id: Option<Uuid>,
    indicator_id: Uuid,
    value: i32,
) -> GroupSubmissionResult {
    world
        .service()
        .submit_group(
            &world.actor(Role::Manager),
            &GroupSubmission {
                group_id,
                indicator_id,
                organization_id: world.organization_id,
                project_id: world.project_id,
                start: day(2024, 1, 1),
                end: day(2024, 1, 31),
                rows: vec![BreakdownRow::new(value).with("sex", "F")],
            },
        )
        .unwrap()
}

#[test]
fn human_flags_survive_dependency_convergence() {
    let world = World::new();
    let prerequisite = world.indicator("HIV1", IndicatorType::Integer);
    let dependent =
        world.indicator_with("HIV2", IndicatorType::Integer, &[], &[prerequisite.id], &[]);
    world.task(prerequisite.id);
    world.task(dependent.id);

    let dependent_group = submit(&world, None, dependent.id, 10);
    let target = FlagTarget::count(dependent_group.counts[0].id);
    let reviewer = Uuid::new_v4();
    let flags = FlagService::new(SqliteFlagRepository::new(&world.conn));
    flags
        .raise_manual(target, "Tally sheet is illegible", reviewer)
        .unwrap();

    submit(&world, None, prerequisite.id, 40);

    let open = flags.open_flags(target).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].reason_type, FlagReasonType::Manual);
    assert!(!open[0].auto_flagged);

    let history = flags.flags_for(target).unwrap();
    assert_eq!(history.len(), 2);
    let auto = history
        .iter()
        .find(|flag| flag.reason == missing_reason(&prerequisite))
        .unwrap();
    assert!(auto.resolved && auto.auto_resolved);
    assert!(auto.resolved_at.is_some());
}

#[test]
fn reraised_flag_keeps_its_resolved_history() {
    let world = World::new();
    let prerequisite = world.indicator("HIV1", IndicatorType::Integer);
    let dependent =
        world.indicator_with("HIV2", IndicatorType::Integer, &[], &[prerequisite.id], &[]);
    world.task(prerequisite.id);
    world.task(dependent.id);

    let prerequisite_group = submit(&world, None, prerequisite.id, 20);
    let dependent_group = submit(&world, None, dependent.id, 15);
    assert!(dependent_group.flags.is_empty());
    let target = FlagTarget::count(dependent_group.counts[0].id);

    let lowered = submit(&world, Some(prerequisite_group.group.id), prerequisite.id, 10);
    assert_eq!(lowered.flags.raised.len(), 1);
    let raised = submit(&world, Some(prerequisite_group.group.id), prerequisite.id, 30);
    assert_eq!(raised.flags.resolved.len(), 1);
    let lowered_again = submit(&world, Some(prerequisite_group.group.id), prerequisite.id, 12);
    assert_eq!(lowered_again.flags.raised.len(), 1);

    let history = world.service().flags_for(target).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|flag| !flag.resolved).count(), 1);
}

#[test]
fn manual_resolution_records_reviewer_and_note() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let target = FlagTarget::new(TargetKind::Indicator, indicator.id);
    let flags = FlagService::new(SqliteFlagRepository::new(&world.conn));
    let reviewer = Uuid::new_v4();

    let FlagOutcome::Raised(flag) = flags
        .raise_manual(target, "Definition unclear", reviewer)
        .unwrap()
    else {
        panic!("expected a new flag");
    };
    assert_eq!(flag.caused_by, Some(reviewer));

    let closed = flags
        .resolve_manual(flag.id, reviewer, Some("   ".to_string()))
        .unwrap();
    assert_eq!(closed.resolved_by, Some(reviewer));
    assert_eq!(closed.resolved_reason, None);

    let missing = flags.resolve_manual(Uuid::new_v4(), reviewer, None);
    assert!(matches!(missing, Err(FlagServiceError::NotFound(_))));
    let blank = flags.raise_manual(target, "  ", reviewer);
    assert!(matches!(blank, Err(FlagServiceError::InvalidReason)));
}

fn always_exists(_conn: &Connection, _id: Uuid) -> rusqlite::Result<bool> {
    Ok(true)
}

#[test]
fn target_registry_decides_which_kinds_can_be_flagged() {
    let world = World::new();
    let event_target = FlagTarget::new(TargetKind::Event, Uuid::new_v4());

    let restricted = FlagService::new(SqliteFlagRepository::with_registry(
        &world.conn,
        TargetRegistry::empty(),
    ));
    let err = restricted
        .create(event_target, "stale", FlagReasonType::MissingPrerequisite, None)
        .unwrap_err();
    assert!(matches!(
        err,
        FlagServiceError::Repo(RepoError::UnregisteredTarget(TargetKind::Event))
    ));

    let defaults = FlagService::new(SqliteFlagRepository::new(&world.conn));
    let err = defaults
        .create(event_target, "stale", FlagReasonType::MissingPrerequisite, None)
        .unwrap_err();
    assert!(matches!(err, FlagServiceError::UnknownTarget(_)));

    let permissive = FlagService::new(SqliteFlagRepository::with_registry(
        &world.conn,
        TargetRegistry::empty().register(TargetKind::Event, always_exists),
    ));
    let outcome = permissive
        .create(event_target, "stale", FlagReasonType::MissingPrerequisite, None)
        .unwrap();
    assert!(outcome.changed());
}
