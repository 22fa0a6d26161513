//! Advisory flags on arbitrary targets.
//!
//! # Invariants
//! - At most one unresolved flag exists per (target, reason).
//! - `auto_resolved` implies `resolved`.
//! - Human-raised flags (`auto_flagged == false`) are only resolved by humans.

use crate::model::catalog::ActorId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type FlagId = Uuid;

/// Kind half of a polymorphic flag target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Count,
    AggregateGroup,
    Event,
    Task,
    Indicator,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::AggregateGroup => "aggregate_group",
            Self::Event => "event",
            Self::Task => "task",
            Self::Indicator => "indicator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "count" => Some(Self::Count),
            "aggregate_group" => Some(Self::AggregateGroup),
            "event" => Some(Self::Event),
            "task" => Some(Self::Task),
            "indicator" => Some(Self::Indicator),
            _ => None,
        }
    }
}

/// Tagged reference to the flagged entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagTarget {
    pub kind: TargetKind,
    pub id: Uuid,
}

impl FlagTarget {
    pub fn new(kind: TargetKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn count(id: Uuid) -> Self {
        Self::new(TargetKind::Count, id)
    }
}

impl Display for FlagTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReasonType {
    MissingPrerequisite,
    ExceedsPrerequisite,
    Manual,
}

impl FlagReasonType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingPrerequisite => "missing_prerequisite",
            Self::ExceedsPrerequisite => "exceeds_prerequisite",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missing_prerequisite" => Some(Self::MissingPrerequisite),
            "exceeds_prerequisite" => Some(Self::ExceedsPrerequisite),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub id: FlagId,
    pub target: FlagTarget,
    pub reason: String,
    pub reason_type: FlagReasonType,
    pub auto_flagged: bool,
    pub resolved: bool,
    pub auto_resolved: bool,
    pub caused_by: Option<ActorId>,
    pub resolved_by: Option<ActorId>,
    pub resolved_reason: Option<String>,
    /// Epoch ms.
    pub created_at: i64,
    /// Epoch ms.
    pub resolved_at: Option<i64>,
}

/// Insert payload for one flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlag {
    pub id: FlagId,
    pub target: FlagTarget,
    pub reason: String,
    pub reason_type: FlagReasonType,
    pub auto_flagged: bool,
    pub caused_by: Option<ActorId>,
}

/// How an open flag is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagResolution {
    pub resolved_by: Option<ActorId>,
    pub auto: bool,
    pub note: Option<String>,
}

/// Flags raised and resolved by one write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDelta {
    pub raised: Vec<Flag>,
    pub resolved: Vec<Flag>,
}

impl FlagDelta {
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.resolved.is_empty()
    }

    pub fn merge(&mut self, other: FlagDelta) {
        self.raised.extend(other.raised);
        self.resolved.extend(other.resolved);
    }
}
