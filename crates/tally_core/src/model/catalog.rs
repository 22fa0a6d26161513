//! Reference records resolved from collaborators.
//!
//! # Responsibility
//! - Describe indicators, tasks, events, organizations and actors as the
//!   engine consumes them.
//! - Describe dependency edges between indicators.
//!
//! # Invariants
//! - Option-bearing indicators are exactly the single/multi select types.
//! - An indicator never depends on itself.

use crate::model::window::DateWindow;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type OrganizationId = Uuid;
pub type ProjectId = Uuid;
pub type IndicatorId = Uuid;
pub type AssessmentId = Uuid;
pub type TaskId = Uuid;
pub type EventId = Uuid;
pub type ActorId = Uuid;

/// Typed reference used in not-found and conflict errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "entity", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Organization(OrganizationId),
    Project(ProjectId),
    Indicator(IndicatorId),
    Task(TaskId),
    Event(EventId),
    Group(Uuid),
    Count(Uuid),
    Flag(Uuid),
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Organization(id) => write!(f, "organization {id}"),
            Self::Project(id) => write!(f, "project {id}"),
            Self::Indicator(id) => write!(f, "indicator {id}"),
            Self::Task(id) => write!(f, "task {id}"),
            Self::Event(id) => write!(f, "event {id}"),
            Self::Group(id) => write!(f, "aggregate group {id}"),
            Self::Count(id) => write!(f, "count {id}"),
            Self::Flag(id) => write!(f, "flag {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

/// Response type of an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Integer,
    SingleSelect,
    MultiSelect,
    YesNo,
    /// Free text responses; never counted.
    Text,
}

impl IndicatorType {
    /// Rows for these types must name an option or the total marker.
    pub fn is_option_bearing(self) -> bool {
        matches!(self, Self::SingleSelect | Self::MultiSelect)
    }

    /// Option rows of these types must be bounded by a same-breakdown
    /// total row.
    pub fn requires_total_rows(self) -> bool {
        matches!(self, Self::MultiSelect)
    }

    pub fn is_countable(self) -> bool {
        !matches!(self, Self::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::SingleSelect => "single_select",
            Self::MultiSelect => "multi_select",
            Self::YesNo => "yes_no",
            Self::Text => "text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "integer" => Some(Self::Integer),
            "single_select" => Some(Self::SingleSelect),
            "multi_select" => Some(Self::MultiSelect),
            "yes_no" => Some(Self::YesNo),
            "text" => Some(Self::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorCategory {
    Assessment,
    Event,
    /// Tracked from post metrics, never through aggregate submissions.
    Social,
    Misc,
}

impl IndicatorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assessment => "assessment",
            Self::Event => "event",
            Self::Social => "social",
            Self::Misc => "misc",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "assessment" => Some(Self::Assessment),
            "event" => Some(Self::Event),
            "social" => Some(Self::Social),
            "misc" => Some(Self::Misc),
            _ => None,
        }
    }
}

/// Condition attached to a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConditionKind {
    /// Informational link only.
    None,
    /// The prerequisite must have been recorded.
    Any,
    /// The prerequisite response must equal the given boolean.
    BooleanEquals(bool),
    /// The prerequisite response must reach the given number.
    NumericBound(u64),
}

impl ConditionKind {
    /// Negative conditions cannot be checked against positive-only counts.
    pub fn is_enforceable(self) -> bool {
        !matches!(self, Self::None | Self::BooleanEquals(false))
    }
}

/// One entry of an indicator's logic group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicCondition {
    pub source_indicator_id: IndicatorId,
    pub condition: ConditionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub id: IndicatorId,
    /// Short stable code, unique across the catalog.
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IndicatorType,
    pub category: IndicatorCategory,
    pub allow_aggregate: bool,
    /// Option names in display order. Empty for non-select types.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<IndicatorId>,
    #[serde(default)]
    pub logic: Vec<LogicCondition>,
}

impl Indicator {
    /// Creates an indicator with a generated id and no relations.
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        kind: IndicatorType,
        category: IndicatorCategory,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            kind,
            category,
            allow_aggregate: false,
            options: Vec::new(),
            prerequisites: Vec::new(),
            logic: Vec::new(),
        }
    }

    /// Whether aggregate groups may be submitted for this indicator at all.
    pub fn is_aggregatable(&self) -> bool {
        self.allow_aggregate
            && self.kind.is_countable()
            && self.category != IndicatorCategory::Social
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|option| option == name)
    }

    /// Label used in flag reasons; stays stable across renames of `name`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: AssessmentId,
    pub name: String,
    pub indicator_ids: Vec<IndicatorId>,
}

/// Work assignment linking an organization to an indicator in a project.
///
/// Either `indicator_id` or `assessment_id` is set; count submissions on
/// events require `indicator_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub organization_id: OrganizationId,
    pub indicator_id: Option<IndicatorId>,
    pub assessment_id: Option<AssessmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    /// Hosting organization.
    pub organization_id: OrganizationId,
    pub window: DateWindow,
}

/// Where a dependency edge was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyOrigin {
    PrerequisiteList,
    LogicGroup,
}

/// Directed edge `prerequisite -> dependent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent_id: IndicatorId,
    pub prerequisite_id: IndicatorId,
    pub condition: ConditionKind,
    pub origin: DependencyOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Officer,
    Client,
    ViewOnly,
}

impl Role {
    /// Roles allowed to write counts at all.
    pub fn can_submit(self) -> bool {
        matches!(self, Self::Admin | Self::Manager | Self::Officer)
    }
}

/// Authenticated caller, as resolved by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
    pub organization_id: OrganizationId,
}
