//! Pre-persistence validation for count submissions.
//!
//! # Responsibility
//! - Decide actor authority over an (organization, project) pair.
//! - Turn raw rows into keyed, coerced rows: `prepare_rows` for batches
//!   that replace their scope, `prepare_upsert_rows` for batches merged
//!   into stored counts.
//! - Check part-vs-total bounds over stored counts with an upsert batch
//!   laid on top (`check_merged_totals`).
//! - Run the ordered aggregate-group gate before any write.
//!
//! # Invariants
//! - Checks run in a fixed order and stop at the first failing rule; the
//!   error names every offending row for that rule.
//! - Nothing here writes.

use crate::breakdown::schema::{
    active_dimensions, find_duplicate_keys, is_valid_dimension_name, normalize_value,
    BreakdownSchema, CompositeKey, OptionSlot,
};
use crate::breakdown::value::coerce_count;
use crate::model::catalog::{
    Actor, EntityRef, Indicator, IndicatorId, OrganizationId, ProjectId, Role,
};
use crate::model::count::{AggregateGroup, Breakdown, BreakdownRow, Count, GroupId};
use crate::model::window::DateWindow;
use crate::repo::catalog_repo::CatalogRepository;
use crate::repo::group_repo::GroupRepository;
use crate::repo::RepoError;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Named validation rule; `as_str` is the stable machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    NoLinkedTask,
    InvalidDateRange,
    FutureStart,
    OverlappingGroup,
    /// Edited group belongs to another (indicator, project, organization).
    SeriesMismatch,
    IndicatorNotAggregatable,
    /// Text indicators never take counts.
    IndicatorNotCountable,
    MissingOption,
    UnexpectedOption,
    UnknownOption,
    UnexpectedTotalMarker,
    InvalidDimension,
    SchemaMismatch,
    InvalidValue,
    DuplicateKey,
    MissingTotal,
    TotalExceeded,
}

impl ValidationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoLinkedTask => "no_linked_task",
            Self::InvalidDateRange => "invalid_date_range",
            Self::FutureStart => "future_start",
            Self::OverlappingGroup => "overlapping_group",
            Self::SeriesMismatch => "series_mismatch",
            Self::IndicatorNotAggregatable => "indicator_not_aggregatable",
            Self::IndicatorNotCountable => "indicator_not_countable",
            Self::MissingOption => "missing_option",
            Self::UnexpectedOption => "unexpected_option",
            Self::UnknownOption => "unknown_option",
            Self::UnexpectedTotalMarker => "unexpected_total_marker",
            Self::InvalidDimension => "invalid_dimension",
            Self::SchemaMismatch => "schema_mismatch",
            Self::InvalidValue => "invalid_value",
            Self::DuplicateKey => "duplicate_key",
            Self::MissingTotal => "missing_total",
            Self::TotalExceeded => "total_exceeded",
        }
    }
}

/// Structured rejection naming the failing rule and offending row indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub rule: ValidationRule,
    /// Zero-based indexes into the submitted rows; empty for batch-level rules.
    pub rows: Vec<usize>,
    pub detail: String,
}

impl ValidationError {
    pub fn batch(rule: ValidationRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            rows: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn rows(rule: ValidationRule, rows: Vec<usize>, detail: impl Into<String>) -> Self {
        Self {
            rule,
            rows,
            detail: detail.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule.as_str(), self.detail)?;
        if !self.rows.is_empty() {
            let rows: Vec<String> = self.rows.iter().map(ToString::to_string).collect();
            write!(f, " (rows {})", rows.join(", "))?;
        }
        Ok(())
    }
}

impl Error for ValidationError {}

/// Actor lacks authority over the target organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionError {
    pub role: Role,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
}

impl Display for PermissionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "actor has no authority over organization {} in project {}",
            self.organization_id, self.project_id
        )
    }
}

impl Error for PermissionError {}

/// Admins may act anywhere; submitting roles only for their own
/// organization or the organization registered as its parent in the project.
pub fn check_authority(
    actor: &Actor,
    organization_id: OrganizationId,
    project_id: ProjectId,
    parent_id: Option<OrganizationId>,
) -> Result<(), PermissionError> {
    let allowed = match actor.role {
        Role::Admin => true,
        role if role.can_submit() => {
            actor.organization_id == organization_id || parent_id == Some(actor.organization_id)
        }
        _ => false,
    };
    if allowed {
        return Ok(());
    }
    Err(PermissionError {
        role: actor.role,
        organization_id,
        project_id,
    })
}

/// How row dimensions must relate to the batch schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPolicy {
    /// Every row sets exactly the batch schema.
    Uniform,
    /// Rows may leave schema dimensions unset.
    Sparse,
}

/// One validated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRow {
    /// Index in the submitted batch.
    pub index: usize,
    /// Breakdown projected onto the batch schema.
    pub breakdown: Breakdown,
    pub option: Option<String>,
    pub unique_only: bool,
    pub key: CompositeKey,
    /// `None` for blank and zero values; such rows are not persisted.
    pub value: Option<u64>,
}

/// Validated batch ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatch {
    pub schema: BreakdownSchema,
    pub rows: Vec<PreparedRow>,
    /// Option rows must stay within the total row of their breakdown.
    pub requires_totals: bool,
}

impl PreparedBatch {
    /// Rows carrying a value to persist.
    pub fn persistable(&self) -> impl Iterator<Item = &PreparedRow> {
        self.rows.iter().filter(|row| row.value.is_some())
    }

    pub fn skipped(&self) -> usize {
        self.rows.iter().filter(|row| row.value.is_none()).count()
    }
}

/// Validates raw rows against one indicator.
///
/// Checks option rules, dimension names, the schema policy, value coercion,
/// duplicate keys and, for multi-select indicators, part-vs-total bounds
/// within the batch.
pub fn prepare_rows(
    indicator: &Indicator,
    rows: &[BreakdownRow],
    policy: SchemaPolicy,
) -> Result<PreparedBatch, ValidationError> {
    prepare(indicator, rows, policy, true)
}

/// Validates rows that will be upserted into stored counts.
///
/// Rows may be sparse. Part-vs-total bounds are left to
/// [`check_merged_totals`], since the matching total or option row may
/// already be stored.
pub fn prepare_upsert_rows(
    indicator: &Indicator,
    rows: &[BreakdownRow],
) -> Result<PreparedBatch, ValidationError> {
    prepare(indicator, rows, SchemaPolicy::Sparse, false)
}

fn prepare(
    indicator: &Indicator,
    rows: &[BreakdownRow],
    policy: SchemaPolicy,
    batch_totals: bool,
) -> Result<PreparedBatch, ValidationError> {
    let slots = check_options(indicator, rows)?;
    check_dimension_names(rows)?;

    let schema = BreakdownSchema::infer(rows.iter().map(|row| &row.dimensions));
    if policy == SchemaPolicy::Uniform {
        check_uniform_schema(&schema, rows)?;
    }

    let mut values = Vec::with_capacity(rows.len());
    let mut invalid = Vec::new();
    let mut first_problem = None;
    for (index, row) in rows.iter().enumerate() {
        match coerce_count(&row.value) {
            Ok(value) => values.push(value),
            Err(err) => {
                invalid.push(index);
                first_problem.get_or_insert_with(|| err.to_string());
                values.push(None);
            }
        }
    }
    if let Some(problem) = first_problem {
        return Err(ValidationError::rows(
            ValidationRule::InvalidValue,
            invalid,
            problem,
        ));
    }

    let keys: Vec<CompositeKey> = rows
        .iter()
        .zip(&slots)
        .map(|(row, slot)| schema.key_for(&row.dimensions, slot))
        .collect();
    let duplicates = find_duplicate_keys(&keys);
    if let Some((first, _)) = duplicates.first() {
        let mut offending: Vec<usize> = duplicates
            .iter()
            .flat_map(|(first, duplicate)| [*first, *duplicate])
            .collect();
        offending.sort_unstable();
        offending.dedup();
        return Err(ValidationError::rows(
            ValidationRule::DuplicateKey,
            offending,
            format!("duplicate breakdown {}", keys[*first]),
        ));
    }

    let requires_totals = indicator.kind.requires_total_rows();
    if requires_totals && batch_totals {
        check_totals(&schema, rows, &slots, &keys, &values)?;
    }

    let prepared = rows
        .iter()
        .zip(slots)
        .zip(keys)
        .zip(values)
        .enumerate()
        .map(|(index, (((row, slot), key), value))| PreparedRow {
            index,
            breakdown: schema.project(&row.dimensions),
            option: match slot {
                OptionSlot::Option(name) => Some(name),
                OptionSlot::NotApplicable | OptionSlot::Total => None,
            },
            unique_only: row.unique_only,
            key,
            value,
        })
        .collect();

    Ok(PreparedBatch {
        schema,
        rows: prepared,
        requires_totals,
    })
}

fn check_options(
    indicator: &Indicator,
    rows: &[BreakdownRow],
) -> Result<Vec<OptionSlot>, ValidationError> {
    let option_bearing = indicator.kind.is_option_bearing();
    let mut slots = Vec::with_capacity(rows.len());
    let mut failure: Option<(ValidationRule, Vec<usize>, String)> = None;

    for (index, row) in rows.iter().enumerate() {
        let option = normalize_value(row.option.as_deref());
        let problem = match (option_bearing, option, row.unique_only) {
            (true, Some(_), true) => Some((
                ValidationRule::UnexpectedTotalMarker,
                "a total row cannot name an option".to_string(),
            )),
            (true, Some(name), false) if !indicator.has_option(name) => Some((
                ValidationRule::UnknownOption,
                format!("option `{name}` does not belong to {}", indicator.code),
            )),
            (true, None, false) => Some((
                ValidationRule::MissingOption,
                format!("{} rows need an option or the total marker", indicator.kind.as_str()),
            )),
            (false, Some(_), _) => Some((
                ValidationRule::UnexpectedOption,
                format!("{} rows cannot carry an option", indicator.kind.as_str()),
            )),
            (false, None, true) => Some((
                ValidationRule::UnexpectedTotalMarker,
                format!("{} rows cannot carry the total marker", indicator.kind.as_str()),
            )),
            _ => None,
        };

        if let Some((rule, detail)) = problem {
            if failure.is_none() {
                failure = Some((rule, Vec::new(), detail));
            }
            if let Some((first_rule, offending, _)) = failure.as_mut() {
                if *first_rule == rule {
                    offending.push(index);
                }
            }
        }
        slots.push(if row.unique_only {
            OptionSlot::Total
        } else {
            OptionSlot::for_row(option_bearing, option)
        });
    }

    match failure {
        Some((rule, offending, detail)) => Err(ValidationError::rows(rule, offending, detail)),
        None => Ok(slots),
    }
}

fn check_dimension_names(rows: &[BreakdownRow]) -> Result<(), ValidationError> {
    let mut offending = Vec::new();
    let mut first_name = None;
    for (index, row) in rows.iter().enumerate() {
        if let Some(name) = row
            .dimensions
            .keys()
            .find(|name| !is_valid_dimension_name(name))
        {
            offending.push(index);
            first_name.get_or_insert_with(|| name.clone());
        }
    }
    match first_name {
        Some(name) => Err(ValidationError::rows(
            ValidationRule::InvalidDimension,
            offending,
            format!("`{name}` is not a valid dimension name"),
        )),
        None => Ok(()),
    }
}

fn check_uniform_schema(
    schema: &BreakdownSchema,
    rows: &[BreakdownRow],
) -> Result<(), ValidationError> {
    let offending: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| active_dimensions(&row.dimensions).len() != schema.len())
        .map(|(index, _)| index)
        .collect();
    match offending.first() {
        Some(first) => {
            let missing = schema.missing_from(&rows[*first].dimensions);
            Err(ValidationError::rows(
                ValidationRule::SchemaMismatch,
                offending,
                format!(
                    "every row must set the same dimensions; missing: {}",
                    missing.join(", ")
                ),
            ))
        }
        None => Ok(()),
    }
}

fn check_totals(
    schema: &BreakdownSchema,
    rows: &[BreakdownRow],
    slots: &[OptionSlot],
    keys: &[CompositeKey],
    values: &[Option<u64>],
) -> Result<(), ValidationError> {
    let totals: HashMap<&CompositeKey, usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| **slot == OptionSlot::Total)
        .map(|(index, _)| (&keys[index], index))
        .collect();

    let mut missing = Vec::new();
    let mut exceeded = Vec::new();
    for (index, slot) in slots.iter().enumerate() {
        let OptionSlot::Option(_) = slot else {
            continue;
        };
        let Some(value) = values[index] else {
            continue;
        };
        let total_key = schema.key_for(&rows[index].dimensions, &OptionSlot::Total);
        match totals.get(&total_key) {
            None => missing.push(index),
            Some(total_index) => {
                let total = values[*total_index].unwrap_or(0);
                if value > total {
                    exceeded.push((index, *total_index, value, total));
                }
            }
        }
    }

    if let Some(first) = missing.first().copied() {
        return Err(ValidationError::rows(
            ValidationRule::MissingTotal,
            missing,
            format!("no total row for breakdown {}", keys[first]),
        ));
    }
    if let Some((_, _, value, total)) = exceeded.first() {
        let offending = exceeded
            .iter()
            .flat_map(|(row, total_row, _, _)| [*row, *total_row])
            .collect::<Vec<_>>();
        return Err(ValidationError::rows(
            ValidationRule::TotalExceeded,
            dedup_sorted(offending),
            format!("option value {value} exceeds total {total}"),
        ));
    }
    Ok(())
}

/// One option or total cell of a scope after an upsert.
struct MergedCell {
    key: CompositeKey,
    /// `Some` for option cells: the key of their total.
    total_key: Option<String>,
    value: u64,
    /// Batch row that set the cell; `None` when it comes from storage.
    row: Option<usize>,
}

/// Checks part-vs-total bounds on the state an upsert would leave behind.
///
/// `stored` are the scope's counts under the batch schema; pass an empty
/// slice when the batch replaces the scope. Blank batch rows leave stored
/// cells alone, and a blank total with nothing stored counts as 0. Only
/// option/total pairs touched by the batch are reported.
pub fn check_merged_totals(
    batch: &PreparedBatch,
    stored: &[Count],
) -> Result<(), ValidationError> {
    if !batch.requires_totals {
        return Ok(());
    }

    let mut cells: BTreeMap<String, MergedCell> = BTreeMap::new();
    for count in stored {
        let slot = match &count.option {
            Some(name) => OptionSlot::Option(name.clone()),
            None => OptionSlot::Total,
        };
        let key = batch.schema.key_for(&count.breakdown, &slot);
        let total_key = matches!(slot, OptionSlot::Option(_))
            .then(|| batch.schema.key_for(&count.breakdown, &OptionSlot::Total).to_storage());
        cells.insert(
            key.to_storage(),
            MergedCell {
                key,
                total_key,
                value: count.value,
                row: None,
            },
        );
    }
    for row in &batch.rows {
        let storage = row.key.to_storage();
        let total_key = row
            .option
            .as_ref()
            .map(|_| batch.schema.key_for(&row.breakdown, &OptionSlot::Total).to_storage());
        let value = match row.value {
            Some(value) => value,
            None if total_key.is_none() && !cells.contains_key(&storage) => 0,
            None => continue,
        };
        cells.insert(
            storage,
            MergedCell {
                key: row.key.clone(),
                total_key,
                value,
                row: Some(row.index),
            },
        );
    }

    let mut missing: Vec<&MergedCell> = Vec::new();
    let mut exceeded: Vec<(&MergedCell, &MergedCell)> = Vec::new();
    for cell in cells.values() {
        let Some(total_key) = &cell.total_key else {
            continue;
        };
        match cells.get(total_key) {
            None if cell.row.is_some() => missing.push(cell),
            None => {}
            Some(total) => {
                let touched = cell.row.is_some() || total.row.is_some();
                if touched && cell.value > total.value {
                    exceeded.push((cell, total));
                }
            }
        }
    }

    if let Some(first) = missing.first() {
        return Err(ValidationError::rows(
            ValidationRule::MissingTotal,
            dedup_sorted(missing.iter().filter_map(|cell| cell.row).collect()),
            format!("no total row for breakdown {}", first.key),
        ));
    }
    if let Some((option, total)) = exceeded.first() {
        let offending = exceeded
            .iter()
            .flat_map(|(option, total)| [option.row, total.row])
            .flatten()
            .collect();
        return Err(ValidationError::rows(
            ValidationRule::TotalExceeded,
            dedup_sorted(offending),
            format!(
                "option value {} exceeds total {} for breakdown {}",
                option.value, total.value, option.key
            ),
        ));
    }
    Ok(())
}

fn dedup_sorted(mut rows: Vec<usize>) -> Vec<usize> {
    rows.sort_unstable();
    rows.dedup();
    rows
}

/// Failure of the aggregate-group gate.
#[derive(Debug)]
pub enum GateError {
    Permission(PermissionError),
    Validation(ValidationError),
    NotFound(EntityRef),
    Repo(RepoError),
}

impl Display for GateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permission(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(entity) => write!(f, "{entity} not found"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for GateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Permission(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::NotFound(_) => None,
        }
    }
}

impl From<RepoError> for GateError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(entity) => Self::NotFound(entity),
            other => Self::Repo(other),
        }
    }
}

impl From<ValidationError> for GateError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Aggregate-group submission header as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTarget {
    pub group_id: Option<GroupId>,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Everything the persistence step needs from a passed gate.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub indicator: Indicator,
    pub window: DateWindow,
    /// Group being edited, if any.
    pub existing: Option<AggregateGroup>,
    pub batch: PreparedBatch,
}

/// Ordered checks for aggregate-group submissions.
pub struct GroupGate<'a, C: CatalogRepository, G: GroupRepository> {
    catalog: &'a C,
    groups: &'a G,
    today: NaiveDate,
}

impl<'a, C: CatalogRepository, G: GroupRepository> GroupGate<'a, C, G> {
    pub fn new(catalog: &'a C, groups: &'a G, today: NaiveDate) -> Self {
        Self {
            catalog,
            groups,
            today,
        }
    }

    /// Runs every check in order; the first failure wins.
    pub fn check(
        &self,
        actor: &Actor,
        target: &GroupTarget,
        rows: &[BreakdownRow],
    ) -> Result<GateOutcome, GateError> {
        let parent = self
            .catalog
            .parent_organization(target.project_id, target.organization_id)?;
        check_authority(actor, target.organization_id, target.project_id, parent)
            .map_err(GateError::Permission)?;

        let indicator = self
            .catalog
            .get_indicator(target.indicator_id)?
            .ok_or(GateError::NotFound(EntityRef::Indicator(target.indicator_id)))?;

        if !self.catalog.has_linked_task(
            target.organization_id,
            target.project_id,
            target.indicator_id,
        )? {
            return Err(ValidationError::batch(
                ValidationRule::NoLinkedTask,
                format!(
                    "no task links organization {} to {} in project {}",
                    target.organization_id, indicator.code, target.project_id
                ),
            )
            .into());
        }

        let window = DateWindow::new(target.start, target.end).ok_or_else(|| {
            ValidationError::batch(
                ValidationRule::InvalidDateRange,
                format!("start {} is after end {}", target.start, target.end),
            )
        })?;
        if window.start > self.today {
            return Err(ValidationError::batch(
                ValidationRule::FutureStart,
                format!("start {} is in the future", window.start),
            )
            .into());
        }

        let existing = self.check_series(target, window)?;

        if !indicator.is_aggregatable() {
            return Err(ValidationError::batch(
                ValidationRule::IndicatorNotAggregatable,
                format!("{} does not accept aggregate counts", indicator.code),
            )
            .into());
        }

        let batch = prepare_rows(&indicator, rows, SchemaPolicy::Uniform)?;
        Ok(GateOutcome {
            indicator,
            window,
            existing,
            batch,
        })
    }

    fn check_series(
        &self,
        target: &GroupTarget,
        window: DateWindow,
    ) -> Result<Option<AggregateGroup>, GateError> {
        let existing = match target.group_id {
            Some(id) => {
                let group = self
                    .groups
                    .get_group(id)?
                    .ok_or(GateError::NotFound(EntityRef::Group(id)))?;
                if group.indicator_id != target.indicator_id
                    || group.organization_id != target.organization_id
                    || group.project_id != target.project_id
                {
                    return Err(ValidationError::batch(
                        ValidationRule::SeriesMismatch,
                        format!("group {id} belongs to another indicator, organization or project"),
                    )
                    .into());
                }
                Some(group)
            }
            None => None,
        };

        if let Some(other) = self.groups.find_overlapping_group(
            target.indicator_id,
            target.project_id,
            target.organization_id,
            window,
            target.group_id,
        )? {
            return Err(ValidationError::batch(
                ValidationRule::OverlappingGroup,
                format!("window {window} overlaps group {} ({})", other.id, other.window),
            )
            .into());
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        check_authority, check_merged_totals, prepare_rows, prepare_upsert_rows, SchemaPolicy,
        ValidationRule,
    };
    use crate::model::catalog::{Actor, Indicator, IndicatorCategory, IndicatorType, Role};
    use crate::model::count::BreakdownRow;
    use uuid::Uuid;

    fn multi_select() -> Indicator {
        let mut indicator = Indicator::new(
            "PREV1",
            "Prevention items",
            IndicatorType::MultiSelect,
            IndicatorCategory::Assessment,
        );
        indicator.allow_aggregate = true;
        indicator.options = vec!["Condoms".to_string(), "PrEP".to_string()];
        indicator
    }

    fn integer() -> Indicator {
        let mut indicator = Indicator::new(
            "HIV1",
            "Tested",
            IndicatorType::Integer,
            IndicatorCategory::Assessment,
        );
        indicator.allow_aggregate = true;
        indicator
    }

    #[test]
    fn option_value_above_total_is_rejected() {
        let rows = vec![
            BreakdownRow::new(29).with_option("Condoms"),
            BreakdownRow::new(28).total(),
        ];
        let err = prepare_rows(&multi_select(), &rows, SchemaPolicy::Uniform)
            .expect_err("29 > 28 must fail");
        assert_eq!(err.rule, ValidationRule::TotalExceeded);
        assert_eq!(err.rows, vec![0, 1]);
    }

    #[test]
    fn option_rows_need_a_matching_total() {
        let rows = vec![
            BreakdownRow::new(3).with_option("Condoms").with("sex", "F"),
            BreakdownRow::new(5).total().with("sex", "M"),
        ];
        let err = prepare_rows(&multi_select(), &rows, SchemaPolicy::Uniform)
            .expect_err("missing same-breakdown total");
        assert_eq!(err.rule, ValidationRule::MissingTotal);
        assert_eq!(err.rows, vec![0]);
    }

    #[test]
    fn upsert_rows_defer_total_bounds_to_the_merged_state() {
        let rows = vec![BreakdownRow::new(3).with_option("PrEP").with("sex", "M")];
        let batch = prepare_upsert_rows(&multi_select(), &rows).expect("bounds are deferred");
        assert!(batch.requires_totals);

        let err = check_merged_totals(&batch, &[]).expect_err("nothing stored to bound it");
        assert_eq!(err.rule, ValidationRule::MissingTotal);
        assert_eq!(err.rows, vec![0]);

        let rows = vec![
            BreakdownRow::new(3).with_option("PrEP").with("sex", "M"),
            BreakdownRow::new("").total().with("sex", "M"),
        ];
        let batch = prepare_upsert_rows(&multi_select(), &rows).expect("valid rows");
        let err = check_merged_totals(&batch, &[]).expect_err("blank total counts as zero");
        assert_eq!(err.rule, ValidationRule::TotalExceeded);
        assert_eq!(err.rows, vec![0, 1]);
    }

    #[test]
    fn option_rules_follow_indicator_type() {
        let err = prepare_rows(
            &multi_select(),
            &[BreakdownRow::new(1)],
            SchemaPolicy::Uniform,
        )
        .expect_err("select rows need an option");
        assert_eq!(err.rule, ValidationRule::MissingOption);

        let err = prepare_rows(
            &multi_select(),
            &[BreakdownRow::new(1).with_option("Needles")],
            SchemaPolicy::Uniform,
        )
        .expect_err("unknown option");
        assert_eq!(err.rule, ValidationRule::UnknownOption);

        let err = prepare_rows(
            &integer(),
            &[BreakdownRow::new(1).with_option("Condoms")],
            SchemaPolicy::Uniform,
        )
        .expect_err("integer rows carry no option");
        assert_eq!(err.rule, ValidationRule::UnexpectedOption);

        let err = prepare_rows(&integer(), &[BreakdownRow::new(1).total()], SchemaPolicy::Uniform)
            .expect_err("integer rows carry no total marker");
        assert_eq!(err.rule, ValidationRule::UnexpectedTotalMarker);

        let mut single = multi_select();
        single.kind = IndicatorType::SingleSelect;
        let rows = vec![
            BreakdownRow::new(9).with_option("PrEP"),
            BreakdownRow::new(4).total(),
        ];
        prepare_rows(&single, &rows, SchemaPolicy::Uniform)
            .expect("single select totals are not bounded");
    }

    #[test]
    fn uniform_policy_rejects_sparse_rows_and_sparse_accepts_them() {
        let rows = vec![
            BreakdownRow::new(4).with("sex", "M").with("age_range", "20_24"),
            BreakdownRow::new(2).with("sex", "F"),
        ];
        let err = prepare_rows(&integer(), &rows, SchemaPolicy::Uniform).expect_err("mismatch");
        assert_eq!(err.rule, ValidationRule::SchemaMismatch);
        assert_eq!(err.rows, vec![1]);

        let batch = prepare_rows(&integer(), &rows, SchemaPolicy::Sparse).expect("sparse ok");
        assert_eq!(batch.schema.len(), 2);
        assert_eq!(batch.rows[1].breakdown["age_range"], None);
    }

    #[test]
    fn duplicates_are_found_even_among_skipped_rows() {
        let rows = vec![
            BreakdownRow::new(35).with("sex", "M").with("age_range", "20_24"),
            BreakdownRow::new(25).with("sex", "M").with("age_range", "20_24"),
        ];
        let err = prepare_rows(&integer(), &rows, SchemaPolicy::Sparse).expect_err("duplicate");
        assert_eq!(err.rule, ValidationRule::DuplicateKey);
        assert_eq!(err.rows, vec![0, 1]);

        let rows = vec![
            BreakdownRow::new(0).with("sex", "F"),
            BreakdownRow::new("").with("sex", "F"),
        ];
        let err = prepare_rows(&integer(), &rows, SchemaPolicy::Sparse).expect_err("duplicate");
        assert_eq!(err.rule, ValidationRule::DuplicateKey);
    }

    #[test]
    fn invalid_values_and_names_are_reported() {
        let rows = vec![
            BreakdownRow::new(-1).with("sex", "F"),
            BreakdownRow::new("abc").with("sex", "M"),
        ];
        let err = prepare_rows(&integer(), &rows, SchemaPolicy::Uniform).expect_err("values");
        assert_eq!(err.rule, ValidationRule::InvalidValue);
        assert_eq!(err.rows, vec![0, 1]);

        let rows = vec![BreakdownRow::new(1).with("Sex", "F")];
        let err = prepare_rows(&integer(), &rows, SchemaPolicy::Uniform).expect_err("name");
        assert_eq!(err.rule, ValidationRule::InvalidDimension);
    }

    #[test]
    fn blank_values_are_kept_but_not_persistable() {
        let rows = vec![
            BreakdownRow::new(0).with("sex", "F"),
            BreakdownRow::new(7).with("sex", "M"),
        ];
        let batch = prepare_rows(&integer(), &rows, SchemaPolicy::Uniform).expect("valid");
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.persistable().count(), 1);
        assert_eq!(batch.skipped(), 1);
    }

    #[test]
    fn authority_follows_role_and_parent_organization() {
        let org = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let project = Uuid::new_v4();
        let actor = |role, organization_id| Actor {
            id: Uuid::new_v4(),
            role,
            organization_id,
        };

        assert!(check_authority(&actor(Role::Admin, Uuid::new_v4()), org, project, None).is_ok());
        assert!(check_authority(&actor(Role::Officer, org), org, project, None).is_ok());
        assert!(check_authority(&actor(Role::Manager, parent), org, project, Some(parent)).is_ok());
        assert!(check_authority(&actor(Role::Manager, parent), org, project, None).is_err());
        assert!(check_authority(&actor(Role::Client, org), org, project, None).is_err());
        assert!(check_authority(&actor(Role::ViewOnly, org), org, project, None).is_err());
    }
}
