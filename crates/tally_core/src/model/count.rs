//! Count records, their owning scopes, and submission rows.
//!
//! # Responsibility
//! - Define the persisted `Count` and `AggregateGroup` records.
//! - Define the raw `BreakdownRow` shape accepted from collaborators.
//!
//! # Invariants
//! - A count belongs to exactly one `CountScope`.
//! - `breakdown` of a stored count lists every dimension of its scope
//!   schema; unset dimensions are `None`.
//! - `key` is the storage form of the composite key under the scope schema.

use crate::model::catalog::{ActorId, EventId, IndicatorId, OrganizationId, ProjectId, TaskId};
use crate::model::window::DateWindow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type CountId = Uuid;
pub type GroupId = Uuid;

/// Sparse mapping from dimension name to value.
pub type Breakdown = BTreeMap<String, Option<String>>;

/// Exclusive owner of a set of mutually non-duplicate counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CountScope {
    /// Time-boxed aggregate group; always rewritten in full.
    Group { group_id: GroupId },
    /// One task within one event; upserted by composite key.
    Task { event_id: EventId, task_id: TaskId },
}

impl Display for CountScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Group { group_id } => write!(f, "group:{group_id}"),
            Self::Task { event_id, task_id } => write!(f, "task:{event_id}/{task_id}"),
        }
    }
}

/// Raw value token as submitted.
///
/// Accepts JSON integers and strings; anything else is rejected during row
/// preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountInput {
    Integer(i64),
    /// Integers beyond the signed range; rejected as too large.
    Unsigned(u64),
    Decimal(f64),
    Text(String),
}

impl Default for CountInput {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<i32> for CountInput {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for CountInput {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for CountInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One submitted row: a value plus its breakdown.
///
/// Serialized flat, e.g.
/// `{"value": 12, "option": "Condoms", "sex": "F", "age_range": "20_24"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownRow {
    #[serde(default)]
    pub value: CountInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    /// Marks the multi-select total row.
    #[serde(default)]
    pub unique_only: bool,
    #[serde(flatten)]
    pub dimensions: Breakdown,
}

impl BreakdownRow {
    pub fn new(value: impl Into<CountInput>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Sets one breakdown dimension.
    pub fn with(mut self, dimension: &str, value: &str) -> Self {
        self.dimensions
            .insert(dimension.to_string(), Some(value.to_string()));
        self
    }

    pub fn with_option(mut self, option: &str) -> Self {
        self.option = Some(option.to_string());
        self
    }

    /// Marks the row as the multi-select total.
    pub fn total(mut self) -> Self {
        self.unique_only = true;
        self
    }
}

/// Aggregate group: counts for one indicator, organization and project over
/// one date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub id: GroupId,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub window: DateWindow,
    pub created_by: Option<ActorId>,
    /// Epoch ms.
    pub created_at: i64,
    pub updated_by: Option<ActorId>,
    /// Epoch ms.
    pub updated_at: i64,
}

/// Persisted count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub id: CountId,
    pub scope: CountScope,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    /// Window of the owning group or event.
    pub window: DateWindow,
    pub breakdown: Breakdown,
    pub option: Option<String>,
    pub unique_only: bool,
    pub key: String,
    pub value: u64,
    pub created_by: Option<ActorId>,
    pub created_at: i64,
    pub updated_by: Option<ActorId>,
    pub updated_at: i64,
}

/// Insert payload for one count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCount {
    pub id: CountId,
    pub scope: CountScope,
    pub indicator_id: IndicatorId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub window: DateWindow,
    pub breakdown: Breakdown,
    pub option: Option<String>,
    pub unique_only: bool,
    pub key: String,
    pub value: u64,
    pub created_by: Option<ActorId>,
}
