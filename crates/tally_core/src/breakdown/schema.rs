//! Breakdown schema inference and composite keys.

use crate::model::count::Breakdown;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

static DIMENSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid dimension name regex"));

/// Key component carrying the option slot of option-bearing indicators.
pub const OPTION_COMPONENT: &str = "#option";
/// Option slot value of a multi-select total row.
pub const TOTAL_MARKER: &str = "#total";

/// Returns whether `name` may be used as a breakdown dimension.
pub fn is_valid_dimension_name(name: &str) -> bool {
    DIMENSION_NAME_RE.is_match(name)
}

/// Trims a dimension value; blank values count as unset.
pub fn normalize_value(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Dimensions carrying a non-blank value in one row.
pub fn active_dimensions(breakdown: &Breakdown) -> BTreeSet<String> {
    breakdown
        .iter()
        .filter(|(_, value)| normalize_value(value.as_deref()).is_some())
        .map(|(name, _)| name.clone())
        .collect()
}

/// Option component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionSlot {
    /// Indicator has no options; the key carries no option component.
    NotApplicable,
    Option(String),
    /// Total row of an option-bearing indicator.
    Total,
}

impl OptionSlot {
    /// Chooses the slot for a row of an indicator.
    ///
    /// Rows of option-bearing indicators without an option name are total
    /// rows; whether that is allowed is decided by row validation.
    pub fn for_row(option_bearing: bool, option: Option<&str>) -> Self {
        if !option_bearing {
            return Self::NotApplicable;
        }
        match normalize_value(option) {
            Some(name) => Self::Option(name.to_string()),
            None => Self::Total,
        }
    }

    fn component(&self) -> Option<(String, Option<String>)> {
        match self {
            Self::NotApplicable => None,
            Self::Option(name) => Some((OPTION_COMPONENT.to_string(), Some(name.clone()))),
            Self::Total => Some((OPTION_COMPONENT.to_string(), Some(TOTAL_MARKER.to_string()))),
        }
    }
}

/// Ordered set of dimensions in active use within a batch or scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakdownSchema {
    dimensions: BTreeSet<String>,
}

impl BreakdownSchema {
    /// Infers the schema of an incoming batch: every dimension with a
    /// non-blank value in at least one row.
    pub fn infer<'a, I>(breakdowns: I) -> Self
    where
        I: IntoIterator<Item = &'a Breakdown>,
    {
        let mut dimensions = BTreeSet::new();
        for breakdown in breakdowns {
            dimensions.extend(active_dimensions(breakdown));
        }
        Self { dimensions }
    }

    /// Schema of persisted counts.
    ///
    /// Stored breakdowns list unset dimensions explicitly, so a dimension
    /// stored as unset everywhere still belongs to the schema.
    pub fn from_stored<'a, I>(breakdowns: I) -> Self
    where
        I: IntoIterator<Item = &'a Breakdown>,
    {
        let mut dimensions = BTreeSet::new();
        for breakdown in breakdowns {
            dimensions.extend(breakdown.keys().cloned());
        }
        Self { dimensions }
    }

    pub fn from_dimensions<I, S>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dimensions: dimensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn contains(&self, dimension: &str) -> bool {
        self.dimensions.contains(dimension)
    }

    /// Schema dimensions the row leaves unset.
    pub fn missing_from(&self, breakdown: &Breakdown) -> Vec<String> {
        let active = active_dimensions(breakdown);
        self.dimensions
            .iter()
            .filter(|dimension| !active.contains(*dimension))
            .cloned()
            .collect()
    }

    /// Restricts a row to the schema, trimming values; absent and blank
    /// dimensions become `None`.
    pub fn project(&self, breakdown: &Breakdown) -> Breakdown {
        self.dimensions
            .iter()
            .map(|dimension| {
                let value = breakdown
                    .get(dimension)
                    .and_then(|value| normalize_value(value.as_deref()))
                    .map(str::to_string);
                (dimension.clone(), value)
            })
            .collect()
    }

    /// Composite key of a row under this schema.
    pub fn key_for(&self, breakdown: &Breakdown, slot: &OptionSlot) -> CompositeKey {
        let mut components: Vec<(String, Option<String>)> =
            self.project(breakdown).into_iter().collect();
        if let Some(component) = slot.component() {
            components.push(component);
        }
        CompositeKey(components)
    }
}

/// Ordered `(dimension, value)` tuple identifying one count within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(Vec<(String, Option<String>)>);

impl CompositeKey {
    pub fn components(&self) -> &[(String, Option<String>)] {
        &self.0
    }

    /// Canonical text stored in `counts.key_text`.
    pub fn to_storage(&self) -> String {
        Value::Array(
            self.0
                .iter()
                .map(|(dimension, value)| {
                    Value::Array(vec![
                        Value::String(dimension.clone()),
                        value.clone().map_or(Value::Null, Value::String),
                    ])
                })
                .collect(),
        )
        .to_string()
    }
}

impl Display for CompositeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(no breakdown)");
        }
        for (index, (dimension, value)) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match value {
                Some(value) => write!(f, "{dimension}={value}")?,
                None => write!(f, "{dimension}=unset")?,
            }
        }
        Ok(())
    }
}

/// Returns `(first, duplicate)` index pairs for keys seen more than once.
pub fn find_duplicate_keys(keys: &[CompositeKey]) -> Vec<(usize, usize)> {
    let mut first_seen: HashMap<&CompositeKey, usize> = HashMap::new();
    let mut duplicates = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        match first_seen.get(key) {
            Some(first) => duplicates.push((*first, index)),
            None => {
                first_seen.insert(key, index);
            }
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::{
        find_duplicate_keys, is_valid_dimension_name, BreakdownSchema, OptionSlot, TOTAL_MARKER,
    };
    use crate::model::count::Breakdown;

    fn breakdown(pairs: &[(&str, Option<&str>)]) -> Breakdown {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
            .collect()
    }

    #[test]
    fn infer_ignores_blank_values_and_orders_dimensions() {
        let rows = [
            breakdown(&[("sex", Some("M")), ("disability", Some("  "))]),
            breakdown(&[("age_range", Some("20_24")), ("district", None)]),
        ];
        let schema = BreakdownSchema::infer(rows.iter());
        let dims: Vec<&str> = schema.dimensions().collect();
        assert_eq!(dims, vec!["age_range", "sex"]);
    }

    #[test]
    fn stored_schema_keeps_unset_dimensions() {
        let stored = [breakdown(&[("sex", Some("F")), ("age_range", None)])];
        let schema = BreakdownSchema::from_stored(stored.iter());
        assert!(schema.contains("age_range"));
        assert_ne!(schema, BreakdownSchema::infer(stored.iter()));
    }

    #[test]
    fn key_treats_absent_and_blank_alike_under_fixed_schema() {
        let schema = BreakdownSchema::from_dimensions(["age_range", "sex"]);
        let absent = schema.key_for(
            &breakdown(&[("sex", Some("M"))]),
            &OptionSlot::NotApplicable,
        );
        let blank = schema.key_for(
            &breakdown(&[("sex", Some(" M ")), ("age_range", Some(""))]),
            &OptionSlot::NotApplicable,
        );
        assert_eq!(absent, blank);
        assert_eq!(absent.to_storage(), r#"[["age_range",null],["sex","M"]]"#);
    }

    #[test]
    fn key_ignores_dimensions_outside_schema() {
        let schema = BreakdownSchema::from_dimensions(["sex"]);
        let key = schema.key_for(
            &breakdown(&[("sex", Some("F")), ("district", Some("North"))]),
            &OptionSlot::NotApplicable,
        );
        assert_eq!(key.components().len(), 1);
    }

    #[test]
    fn total_and_option_rows_never_collide() {
        let schema = BreakdownSchema::from_dimensions(["sex"]);
        let row = breakdown(&[("sex", Some("F"))]);
        let total = schema.key_for(&row, &OptionSlot::for_row(true, None));
        let option = schema.key_for(&row, &OptionSlot::for_row(true, Some("Condoms")));
        assert_ne!(total, option);
        assert!(total.to_storage().contains(TOTAL_MARKER));
        assert_eq!(
            OptionSlot::for_row(false, Some("Condoms")),
            OptionSlot::NotApplicable
        );
    }

    #[test]
    fn duplicate_detection_reports_index_pairs() {
        let schema = BreakdownSchema::from_dimensions(["age_range", "sex"]);
        let row = breakdown(&[("sex", Some("M")), ("age_range", Some("20_24"))]);
        let other = breakdown(&[("sex", Some("F")), ("age_range", Some("20_24"))]);
        let keys = vec![
            schema.key_for(&row, &OptionSlot::NotApplicable),
            schema.key_for(&other, &OptionSlot::NotApplicable),
            schema.key_for(&row, &OptionSlot::NotApplicable),
        ];
        assert_eq!(find_duplicate_keys(&keys), vec![(0, 2)]);
    }

    #[test]
    fn dimension_names_are_snake_case_identifiers() {
        assert!(is_valid_dimension_name("age_range"));
        assert!(is_valid_dimension_name("kp_type2"));
        assert!(!is_valid_dimension_name("Age"));
        assert!(!is_valid_dimension_name("2sex"));
        assert!(!is_valid_dimension_name("#option"));
        assert!(!is_valid_dimension_name(""));
    }
}
