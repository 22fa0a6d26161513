//! Cross-indicator dependency evaluation.
//!
//! # Responsibility
//! - Load the prerequisite/dependent adjacency of the indicators a write
//!   touches, once per batch.
//! - Compare persisted counts against matching prerequisite counts in
//!   overlapping windows and converge "missing" / "exceeds" flags.
//!
//! # Invariants
//! - Per (dependent, prerequisite) pair at most one edge survives; a logic
//!   condition replaces a plain prerequisite-list entry.
//! - Self-edges are dropped.
//! - Evaluation only reads counts; re-running it against an unchanged store
//!   leaves flag state unchanged.

use crate::breakdown::schema::{BreakdownSchema, OptionSlot};
use crate::model::catalog::{
    ActorId, ConditionKind, Dependency, DependencyOrigin, EntityRef, Indicator, IndicatorId,
    OrganizationId, ProjectId,
};
use crate::model::count::Count;
use crate::model::flag::{FlagDelta, FlagReasonType, FlagTarget};
use crate::model::window::DateWindow;
use crate::repo::catalog_repo::CatalogRepository;
use crate::repo::count_repo::CountRepository;
use crate::repo::flag_repo::FlagRepository;
use crate::repo::{RepoError, RepoResult};
use crate::service::flag_service::{FlagOutcome, FlagService, FlagServiceError};
use log::debug;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Instant;

/// Reason text of the flag raised when no prerequisite count matches.
pub fn missing_reason(prerequisite: &Indicator) -> String {
    format!(
        "Missing prerequisite {} for the same breakdown and period",
        prerequisite.label()
    )
}

/// Reason text of the flag raised when a count exceeds its prerequisite.
pub fn exceeds_reason(prerequisite: &Indicator) -> String {
    format!(
        "Value exceeds prerequisite {} for the same breakdown and period",
        prerequisite.label()
    )
}

/// Indicator adjacency for one batch.
///
/// Upstream edges are complete for the roots it was loaded for, downstream
/// edges likewise.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    indicators: HashMap<IndicatorId, Indicator>,
    upstream: HashMap<IndicatorId, Vec<Dependency>>,
    downstream: HashMap<IndicatorId, Vec<Dependency>>,
}

impl DependencyGraph {
    pub fn load<C: CatalogRepository>(catalog: &C, roots: &[IndicatorId]) -> RepoResult<Self> {
        let roots: BTreeSet<IndicatorId> = roots.iter().copied().collect();
        let root_list: Vec<IndicatorId> = roots.iter().copied().collect();

        let mut merged: BTreeMap<(IndicatorId, IndicatorId), Dependency> = BTreeMap::new();
        for dependency in catalog.list_dependencies(&root_list)? {
            if dependency.dependent_id == dependency.prerequisite_id {
                continue;
            }
            match merged.entry((dependency.dependent_id, dependency.prerequisite_id)) {
                Entry::Vacant(slot) => {
                    slot.insert(dependency);
                }
                Entry::Occupied(mut slot) => {
                    if dependency.origin == DependencyOrigin::LogicGroup {
                        slot.insert(dependency);
                    }
                }
            }
        }

        let mut graph = Self::default();
        let mut wanted: BTreeSet<IndicatorId> = roots.clone();
        for dependency in merged.into_values() {
            wanted.insert(dependency.dependent_id);
            wanted.insert(dependency.prerequisite_id);
            if roots.contains(&dependency.dependent_id) {
                graph
                    .upstream
                    .entry(dependency.dependent_id)
                    .or_default()
                    .push(dependency);
            }
            if roots.contains(&dependency.prerequisite_id) {
                graph
                    .downstream
                    .entry(dependency.prerequisite_id)
                    .or_default()
                    .push(dependency);
            }
        }

        for id in wanted {
            let indicator = catalog
                .get_indicator(id)?
                .ok_or(RepoError::NotFound(EntityRef::Indicator(id)))?;
            graph.indicators.insert(id, indicator);
        }
        Ok(graph)
    }

    pub fn indicator(&self, id: IndicatorId) -> Option<&Indicator> {
        self.indicators.get(&id)
    }

    /// Edges into `id`, sorted by prerequisite id.
    pub fn prerequisites_of(&self, id: IndicatorId) -> &[Dependency] {
        self.upstream.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Edges out of `id`, sorted by dependent id.
    pub fn dependents_of(&self, id: IndicatorId) -> &[Dependency] {
        self.downstream.get(&id).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CandidateKey {
    indicator_id: IndicatorId,
    organization_id: OrganizationId,
    project_id: ProjectId,
    window: DateWindow,
}

/// Drives flag convergence for one evaluation pass.
///
/// Build it after the pass's counts are persisted; prerequisite lookups are
/// cached for the lifetime of the evaluator.
pub struct DependencyEvaluator<'a, K: CountRepository, F: FlagRepository> {
    graph: &'a DependencyGraph,
    counts: &'a K,
    flags: &'a FlagService<F>,
    actor: Option<ActorId>,
    candidates: HashMap<CandidateKey, Rc<Vec<Count>>>,
}

impl<'a, K: CountRepository, F: FlagRepository> DependencyEvaluator<'a, K, F> {
    pub fn new(
        graph: &'a DependencyGraph,
        counts: &'a K,
        flags: &'a FlagService<F>,
        actor: Option<ActorId>,
    ) -> Self {
        Self {
            graph,
            counts,
            flags,
            actor,
            candidates: HashMap::new(),
        }
    }

    /// Checks every count against all prerequisites of its indicator.
    pub fn evaluate_persisted(&mut self, counts: &[Count]) -> Result<FlagDelta, FlagServiceError> {
        let started_at = Instant::now();
        let mut delta = FlagDelta::default();
        for count in counts {
            let graph = self.graph;
            for edge in graph.prerequisites_of(count.indicator_id) {
                delta.merge(self.evaluate_edge(count, edge)?);
            }
        }
        debug!(
            "event=dependency_eval module=dependency status=ok pass=upstream counts={} raised={} resolved={} duration_ms={}",
            counts.len(),
            delta.raised.len(),
            delta.resolved.len(),
            started_at.elapsed().as_millis()
        );
        Ok(delta)
    }

    /// Re-checks the counts of every indicator depending on `indicator_id`
    /// whose window overlaps `window`, for that one edge.
    pub fn propagate_downstream(
        &mut self,
        indicator_id: IndicatorId,
        organization_id: OrganizationId,
        project_id: ProjectId,
        window: DateWindow,
    ) -> Result<FlagDelta, FlagServiceError> {
        let started_at = Instant::now();
        let mut delta = FlagDelta::default();
        let mut visited = 0usize;
        let graph = self.graph;
        for edge in graph.dependents_of(indicator_id) {
            let dependents = self.counts.list_overlapping_counts(
                edge.dependent_id,
                organization_id,
                project_id,
                window,
            )?;
            visited += dependents.len();
            for count in &dependents {
                delta.merge(self.evaluate_edge(count, edge)?);
            }
        }
        debug!(
            "event=dependency_eval module=dependency status=ok pass=downstream counts={} raised={} resolved={} duration_ms={}",
            visited,
            delta.raised.len(),
            delta.resolved.len(),
            started_at.elapsed().as_millis()
        );
        Ok(delta)
    }

    /// Converges the two flags one edge can put on one count.
    pub fn evaluate_edge(
        &mut self,
        count: &Count,
        edge: &Dependency,
    ) -> Result<FlagDelta, FlagServiceError> {
        let mut delta = FlagDelta::default();
        if !edge.condition.is_enforceable() {
            return Ok(delta);
        }
        let graph = self.graph;
        let Some(prerequisite) = graph.indicator(edge.prerequisite_id) else {
            return Ok(delta);
        };

        let candidates = self.candidates(
            edge.prerequisite_id,
            count.organization_id,
            count.project_id,
            count.window,
        )?;
        let target = FlagTarget::count(count.id);
        let missing = missing_reason(prerequisite);
        let exceeds = exceeds_reason(prerequisite);

        match matching_value(prerequisite, edge.condition, count, &candidates) {
            None => {
                record(
                    &mut delta,
                    self.flags.create(
                        target,
                        &missing,
                        FlagReasonType::MissingPrerequisite,
                        self.actor,
                    )?,
                );
                record(&mut delta, self.flags.resolve(target, &exceeds, self.actor)?);
            }
            Some(bound) => {
                record(&mut delta, self.flags.resolve(target, &missing, self.actor)?);
                if count.value > bound {
                    record(
                        &mut delta,
                        self.flags.create(
                            target,
                            &exceeds,
                            FlagReasonType::ExceedsPrerequisite,
                            self.actor,
                        )?,
                    );
                } else {
                    record(&mut delta, self.flags.resolve(target, &exceeds, self.actor)?);
                }
            }
        }
        Ok(delta)
    }

    fn candidates(
        &mut self,
        indicator_id: IndicatorId,
        organization_id: OrganizationId,
        project_id: ProjectId,
        window: DateWindow,
    ) -> RepoResult<Rc<Vec<Count>>> {
        let key = CandidateKey {
            indicator_id,
            organization_id,
            project_id,
            window,
        };
        if let Some(cached) = self.candidates.get(&key) {
            return Ok(Rc::clone(cached));
        }
        let loaded = Rc::new(self.counts.list_overlapping_counts(
            indicator_id,
            organization_id,
            project_id,
            window,
        )?);
        self.candidates.insert(key, Rc::clone(&loaded));
        Ok(loaded)
    }
}

fn record(delta: &mut FlagDelta, outcome: FlagOutcome) {
    match outcome {
        FlagOutcome::Raised(flag) => delta.raised.push(flag),
        FlagOutcome::Resolved(flag) => delta.resolved.push(flag),
        FlagOutcome::AlreadyOpen(_) | FlagOutcome::NothingToResolve => {}
    }
}

/// Option slot a dependent count is looked up under in its prerequisite.
fn prerequisite_slot(prerequisite: &Indicator, count: &Count) -> OptionSlot {
    if !prerequisite.kind.is_option_bearing() {
        return OptionSlot::NotApplicable;
    }
    match count.option.as_deref() {
        Some(name) if prerequisite.has_option(name) => OptionSlot::Option(name.to_string()),
        _ => OptionSlot::Total,
    }
}

/// Largest qualifying prerequisite value for `count`, if any matches.
///
/// The dependent breakdown is projected onto each candidate's stored schema
/// and compared key against key.
fn matching_value(
    prerequisite: &Indicator,
    condition: ConditionKind,
    count: &Count,
    candidates: &[Count],
) -> Option<u64> {
    let slot = prerequisite_slot(prerequisite, count);
    candidates
        .iter()
        .filter(|candidate| match condition {
            ConditionKind::NumericBound(bound) => candidate.value >= bound,
            _ => true,
        })
        .filter(|candidate| {
            let schema = BreakdownSchema::from_stored([&candidate.breakdown]);
            schema.key_for(&count.breakdown, &slot).to_storage() == candidate.key
        })
        .map(|candidate| candidate.value)
        .max()
}
