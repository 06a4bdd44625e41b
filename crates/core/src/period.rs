use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive date window used to restrict which rows of an upload are kept.
/// Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (Some(s), Some(e)) => write!(f, "{s} to {e}"),
            (Some(s), None) => write!(f, "from {s}"),
            (None, Some(e)) => write!(f, "until {e}"),
            (None, None) => write!(f, "all dates"),
        }
    }
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        DateRange { start, end }
    }

    pub fn is_unbounded(self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn date_range_contains_inclusive() {
        let range = DateRange::new(Some(d(2025, 10, 1)), Some(d(2025, 10, 31)));
        assert!(range.contains(d(2025, 10, 1)));
        assert!(range.contains(d(2025, 10, 31)));
        assert!(!range.contains(d(2025, 9, 30)));
        assert!(!range.contains(d(2025, 11, 1)));
    }

    #[test]
    fn open_bounds() {
        let from = DateRange::new(Some(d(2025, 10, 1)), None);
        assert!(from.contains(d(2030, 1, 1)));
        assert!(!from.contains(d(2025, 9, 1)));
        assert!(DateRange::default().contains(d(1999, 1, 1)));
        assert!(DateRange::default().is_unbounded());
    }

    #[test]
    fn display() {
        let range = DateRange::new(Some(d(2025, 1, 1)), Some(d(2025, 12, 31)));
        assert_eq!(range.to_string(), "2025-01-01 to 2025-12-31");
        assert_eq!(DateRange::default().to_string(), "all dates");
    }
}
