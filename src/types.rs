//! Common types shared across pipeline components.

use chrono::{Local, NaiveDate};
use std::fmt;

/// The calendar day that scopes a run's snapshot artifacts.
///
/// Computed once when a run starts and passed explicitly to every component
/// that names artifacts, so two artifacts from one run can never straddle a
/// midnight boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunDate(NaiveDate);

impl RunDate {
    /// Today's date according to the process-local clock.
    pub fn today() -> Self {
        Self(Local::now().date_naive())
    }

    /// Build a run date from year, month and day, if the date exists.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }
}

impl fmt::Display for RunDate {
    /// Formats as `YYYY-MM-DD`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_iso_date() {
        let date = RunDate::from_ymd(2024, 3, 7).unwrap();
        assert_eq!(date.to_string(), "2024-03-07");
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        assert!(RunDate::from_ymd(2024, 2, 30).is_none());
    }

    #[test]
    fn test_ordering_follows_calendar() {
        let earlier = RunDate::from_ymd(2023, 12, 31).unwrap();
        let later = RunDate::from_ymd(2024, 1, 1).unwrap();
        assert!(earlier < later);
    }
}
