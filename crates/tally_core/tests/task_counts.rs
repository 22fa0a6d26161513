mod common;

use common::{day, window, World};
use tally_core::model::catalog::{IndicatorType, Role};
use tally_core::model::count::BreakdownRow;
use tally_core::model::flag::{FlagReasonType, FlagTarget};
use tally_core::service::validation::ValidationRule;
use tally_core::{SubmissionError, TaskCountBatch, TaskCountSubmission};
use uuid::Uuid;

fn batch(task_id: Uuid, rows: Vec<BreakdownRow>) -> TaskCountBatch {
    TaskCountBatch { task_id, rows }
}

fn age_sex_rows() -> Vec<BreakdownRow> {
    vec![
        BreakdownRow::new(12).with("sex", "F").with("age_range", "20_24"),
        BreakdownRow::new(8).with("sex", "M").with("age_range", "20_24"),
        BreakdownRow::new(4).with("sex", "F").with("age_range", "25_29"),
    ]
}

#[test]
fn duplicate_breakdown_rejects_the_batch_and_stores_nothing() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);

    let err = world
        .service()
        .submit_task_counts(
            &world.actor(Role::Officer),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(
                    task.id,
                    vec![
                        BreakdownRow::new(35).with("sex", "F").with("age_range", "20_24"),
                        BreakdownRow::new(25).with("sex", "F").with("age_range", "20_24"),
                    ],
                )],
            },
        )
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    match err {
        SubmissionError::TaskBreakdown { task_id, error } => {
            assert_eq!(task_id, task.id);
            assert_eq!(error.rule, ValidationRule::DuplicateKey);
            assert_eq!(error.rows, vec![0, 1]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(world.table_count("counts"), 0);
}

#[test]
fn blank_rows_still_count_as_duplicates() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);

    let err = world
        .service()
        .submit_task_counts(
            &world.actor(Role::Officer),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(
                    task.id,
                    vec![
                        BreakdownRow::new(35).with("sex", "F"),
                        BreakdownRow::new("").with("sex", "F"),
                    ],
                )],
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::TaskBreakdown { ref error, .. } if error.rule == ValidationRule::DuplicateKey
    ));
}

#[test]
fn schema_change_replaces_stored_counts() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Manager);
    let service = world.service();

    service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, age_sex_rows())],
            },
        )
        .unwrap();
    assert_eq!(service.task_counts(event.id, task.id).unwrap().len(), 3);

    let result = service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(
                    task.id,
                    vec![
                        BreakdownRow::new(2).with("disability_type", "visual"),
                        BreakdownRow::new(1).with("disability_type", "hearing"),
                    ],
                )],
            },
        )
        .unwrap();

    let outcome = &result.tasks[0];
    assert!(outcome.schema_replaced);
    assert_eq!(outcome.removed, 3);
    assert_eq!(outcome.created.len(), 2);

    let stored = service.task_counts(event.id, task.id).unwrap();
    assert_eq!(stored.len(), 2);
    for count in &stored {
        assert_eq!(count.breakdown.len(), 1);
        assert!(count.breakdown.contains_key("disability_type"));
    }
}

#[test]
fn resubmitting_the_same_batch_changes_nothing() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Manager);
    let service = world.service();
    let submission = TaskCountSubmission {
        event_id: event.id,
        tasks: vec![batch(task.id, age_sex_rows())],
    };

    let first = service.submit_task_counts(&actor, &submission).unwrap();
    assert_eq!(first.tasks[0].created.len(), 3);
    let before = service.task_counts(event.id, task.id).unwrap();

    let second = service.submit_task_counts(&actor, &submission).unwrap();
    let outcome = &second.tasks[0];
    assert!(!outcome.schema_replaced);
    assert!(outcome.created.is_empty());
    assert!(outcome.updated.is_empty());
    assert_eq!(outcome.unchanged, 3);
    assert!(second.flags.is_empty());
    assert_eq!(service.task_counts(event.id, task.id).unwrap(), before);
}

#[test]
fn upsert_updates_matching_keys_and_keeps_unmentioned_counts() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Manager);
    let service = world.service();

    service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, age_sex_rows())],
            },
        )
        .unwrap();

    let result = service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(
                    task.id,
                    vec![
                        BreakdownRow::new(15).with("sex", "F").with("age_range", "20_24"),
                        BreakdownRow::new(6).with("sex", "M").with("age_range", "25_29"),
                    ],
                )],
            },
        )
        .unwrap();

    let outcome = &result.tasks[0];
    assert_eq!(outcome.updated.len(), 1);
    assert_eq!(outcome.updated[0].value, 15);
    assert_eq!(outcome.created.len(), 1);

    let stored = service.task_counts(event.id, task.id).unwrap();
    assert_eq!(stored.len(), 4);
    let total: u64 = stored.iter().map(|count| count.value).sum();
    assert_eq!(total, 15 + 8 + 4 + 6);
}

#[test]
fn task_rows_may_leave_dimensions_unset() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);

    let result = world
        .service()
        .submit_task_counts(
            &world.actor(Role::Manager),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(
                    task.id,
                    vec![
                        BreakdownRow::new(5).with("sex", "F"),
                        BreakdownRow::new(3).with("sex", "F").with("age_range", "20_24"),
                    ],
                )],
            },
        )
        .unwrap();

    let created = &result.tasks[0].created;
    assert_eq!(created.len(), 2);
    for count in created {
        assert_eq!(count.breakdown.len(), 2);
    }
    assert!(created
        .iter()
        .any(|count| count.breakdown["age_range"].is_none()));
}

#[test]
fn one_invalid_task_rolls_back_every_task_in_the_event() {
    let world = World::new();
    let first = world.indicator("HIV1", IndicatorType::Integer);
    let second = world.indicator("HIV2", IndicatorType::Integer);
    let first_task = world.task(first.id);
    let second_task = world.task(second.id);
    let event = world.event(
        window(day(2024, 1, 10), day(2024, 1, 12)),
        &[&first_task, &second_task],
    );

    let err = world
        .service()
        .submit_task_counts(
            &world.actor(Role::Manager),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![
                    batch(first_task.id, age_sex_rows()),
                    batch(second_task.id, vec![BreakdownRow::new("2.5")]),
                ],
            },
        )
        .unwrap_err();

    match err {
        SubmissionError::TaskBreakdown { task_id, error } => {
            assert_eq!(task_id, second_task.id);
            assert_eq!(error.rule, ValidationRule::InvalidValue);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(world.table_count("counts"), 0);
}

#[test]
fn tasks_must_belong_to_the_event_and_appear_once() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let attached = world.task(indicator.id);
    let detached = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&attached]);
    let actor = world.actor(Role::Manager);
    let service = world.service();

    let err = service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(detached.id, age_sex_rows())],
            },
        )
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidTask { task_id, .. } if task_id == detached.id));

    let err = service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![
                    batch(attached.id, age_sex_rows()),
                    batch(attached.id, age_sex_rows()),
                ],
            },
        )
        .unwrap_err();
    assert!(matches!(err, SubmissionError::InvalidTask { .. }));

    let err = service
        .submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: Uuid::new_v4(),
                tasks: vec![batch(attached.id, age_sex_rows())],
            },
        )
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(world.table_count("counts"), 0);
}

#[test]
fn text_indicator_tasks_take_no_counts() {
    let world = World::new();
    let indicator = world.indicator("NOTE1", IndicatorType::Text);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);

    let err = world
        .service()
        .submit_task_counts(
            &world.actor(Role::Manager),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, vec![BreakdownRow::new(1)])],
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::TaskBreakdown { ref error, .. } if error.rule == ValidationRule::IndicatorNotCountable
    ));
}

#[test]
fn outsider_cannot_write_task_counts() {
    let world = World::new();
    let indicator = world.indicator("HIV1", IndicatorType::Integer);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);

    let err = world
        .service()
        .submit_task_counts(
            &world.actor_of(Role::Manager, world.outsider_id),
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, age_sex_rows())],
            },
        )
        .unwrap_err();
    assert_eq!(err.status_code(), 403);
    assert_eq!(world.table_count("counts"), 0);
}

#[test]
fn lowering_a_stored_total_below_its_option_is_rejected() {
    let world = World::new();
    let indicator =
        world.indicator_with("PREV1", IndicatorType::MultiSelect, &["A", "B"], &[], &[]);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Officer);
    let service = world.service();
    let submit = |rows: Vec<BreakdownRow>| {
        service.submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, rows)],
            },
        )
    };

    submit(vec![
        BreakdownRow::new(10).with("sex", "M").with_option("A"),
        BreakdownRow::new(20).with("sex", "M").total(),
    ])
    .unwrap();
    let before = service.task_counts(event.id, task.id).unwrap();

    let err = submit(vec![BreakdownRow::new(5).with("sex", "M").total()]).unwrap_err();
    match err {
        SubmissionError::TaskBreakdown { task_id, error } => {
            assert_eq!(task_id, task.id);
            assert_eq!(error.rule, ValidationRule::TotalExceeded);
            assert_eq!(error.rows, vec![0]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.task_counts(event.id, task.id).unwrap(), before);

    let err = submit(vec![BreakdownRow::new(25).with("sex", "M").with_option("B")]).unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::TaskBreakdown { ref error, .. } if error.rule == ValidationRule::TotalExceeded
    ));
}

#[test]
fn option_rows_can_be_added_against_a_stored_total() {
    let world = World::new();
    let indicator =
        world.indicator_with("PREV1", IndicatorType::MultiSelect, &["A", "B"], &[], &[]);
    let task = world.task(indicator.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Officer);
    let service = world.service();
    let submit = |rows: Vec<BreakdownRow>| {
        service.submit_task_counts(
            &actor,
            &TaskCountSubmission {
                event_id: event.id,
                tasks: vec![batch(task.id, rows)],
            },
        )
    };

    submit(vec![
        BreakdownRow::new(10).with("sex", "M").with_option("A"),
        BreakdownRow::new(20).with("sex", "M").total(),
    ])
    .unwrap();

    let added = submit(vec![BreakdownRow::new(3).with("sex", "M").with_option("B")]).unwrap();
    assert_eq!(added.tasks[0].created.len(), 1);

    let raised = submit(vec![BreakdownRow::new(12).with("sex", "M").total()]).unwrap();
    assert_eq!(raised.tasks[0].updated[0].value, 12);

    let stored = service.task_counts(event.id, task.id).unwrap();
    assert_eq!(stored.len(), 3);
    let total = stored.iter().find(|count| count.unique_only).unwrap();
    for count in stored.iter().filter(|count| !count.unique_only) {
        assert!(count.value <= total.value);
    }

    let err = submit(vec![BreakdownRow::new(4).with("sex", "F").with_option("A")]).unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::TaskBreakdown { ref error, .. } if error.rule == ValidationRule::MissingTotal
    ));
}

#[test]
fn resubmitting_keeps_an_open_flag_without_raising_another() {
    let world = World::new();
    let prerequisite = world.indicator("HIV1", IndicatorType::Integer);
    let dependent =
        world.indicator_with("HIV2", IndicatorType::Integer, &[], &[prerequisite.id], &[]);
    let task = world.task(dependent.id);
    let event = world.event(window(day(2024, 1, 10), day(2024, 1, 12)), &[&task]);
    let actor = world.actor(Role::Officer);
    let service = world.service();
    let submission = TaskCountSubmission {
        event_id: event.id,
        tasks: vec![batch(task.id, vec![BreakdownRow::new(6).with("sex", "F")])],
    };

    let first = service.submit_task_counts(&actor, &submission).unwrap();
    assert_eq!(first.flags.raised.len(), 1);
    let target = FlagTarget::count(first.tasks[0].created[0].id);

    let second = service.submit_task_counts(&actor, &submission).unwrap();
    assert!(second.flags.raised.is_empty());
    assert!(second.flags.resolved.is_empty());
    assert_eq!(second.tasks[0].unchanged, 1);

    let open: Vec<_> = service
        .flags_for(target)
        .unwrap()
        .into_iter()
        .filter(|flag| !flag.resolved)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].reason_type, FlagReasonType::MissingPrerequisite);
    assert_eq!(world.table_count("flags"), 1);
}
