//! Inclusive date windows owned by aggregate groups and events.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Inclusive `[start, end]` date range.
///
/// Overlap tests treat the window as the half-open interval
/// `[start, end + 1 day)`, so two windows sharing a single day overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Builds a window, returning `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        if start > end {
            return None;
        }
        Some(Self { start, end })
    }

    /// Returns whether both windows share at least one day.
    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start < other.exclusive_end() && self.exclusive_end() > other.start
    }

    /// Returns whether `day` falls inside the window.
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    fn exclusive_end(&self) -> NaiveDate {
        self.end.succ_opt().unwrap_or(NaiveDate::MAX)
    }
}

impl Display for DateWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::DateWindow;
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn window(start: NaiveDate, end: NaiveDate) -> DateWindow {
        DateWindow::new(start, end).expect("ordered window")
    }

    #[test]
    fn new_rejects_inverted_range() {
        assert!(DateWindow::new(day(2024, 2, 1), day(2024, 1, 1)).is_none());
        assert!(DateWindow::new(day(2024, 1, 1), day(2024, 1, 1)).is_some());
    }

    #[test]
    fn windows_sharing_one_day_overlap() {
        let january = window(day(2024, 1, 1), day(2024, 1, 31));
        let from_last_day = window(day(2024, 1, 31), day(2024, 2, 29));
        let single_day = window(day(2024, 1, 31), day(2024, 1, 31));
        assert!(january.overlaps(&from_last_day));
        assert!(single_day.overlaps(&january));
        assert!(single_day.overlaps(&single_day));
    }

    #[test]
    fn adjacent_windows_do_not_overlap() {
        let january = window(day(2024, 1, 1), day(2024, 1, 31));
        let february = window(day(2024, 2, 1), day(2024, 2, 29));
        assert!(!january.overlaps(&february));
        assert!(!february.overlaps(&january));
    }
}
