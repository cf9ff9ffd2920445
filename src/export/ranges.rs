//! Time-range partitioning for chunked folder export.
//!
//! A folder's full time axis is split into bounded sub-ranges so no single
//! upstream retrieval grows large enough to time out on huge folders. The
//! partition is total: an open-ended head up to the resume point (or the
//! fixed lower bound), fixed-width windows walking forward, and an
//! open-ended tail past the fixed upper bound. Adjacent ranges share exact
//! boundaries, so the union has no gap and no overlap.

use crate::config::WINDOW_DAYS;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Everything before this is covered by the single open-ended head range
/// when no resume point is given.
const LOWER_BOUND: (i32, u32, u32) = (2010, 1, 1);

/// Fine-grained windows stop at the first boundary at or past this; the
/// open-ended tail covers the rest.
const UPPER_BOUND: (i32, u32, u32) = (2022, 1, 1);

/// A half-open time window `[start, end)`. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// The unbounded range.
    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Whether `instant` falls inside this range.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| instant >= s) && self.end.map_or(true, |e| instant < e)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.start {
            Some(s) => write!(f, "[{}", s.format("%Y-%m-%d"))?,
            None => write!(f, "[..")?,
        }
        match self.end {
            Some(e) => write!(f, ", {})", e.format("%Y-%m-%d")),
            None => write!(f, ", ..)"),
        }
    }
}

fn bound_datetime((y, m, d): (i32, u32, u32)) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().expect("valid bound date")
}

fn date_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

/// Partition the full time axis for one folder export.
///
/// The resume point sets the boundary between the coarse head range and
/// the fine windows; coverage is total either way.
pub fn partition(resume: Option<NaiveDate>) -> Vec<TimeRange> {
    let window = Duration::days(WINDOW_DAYS);
    let upper = bound_datetime(UPPER_BOUND);
    let start = resume
        .map(date_start)
        .unwrap_or_else(|| bound_datetime(LOWER_BOUND));

    let mut ranges = vec![TimeRange {
        start: None,
        end: Some(start),
    }];

    let mut cursor = start;
    while cursor < upper {
        let end = cursor + window;
        ranges.push(TimeRange {
            start: Some(cursor),
            end: Some(end),
        });
        cursor = end;
    }

    ranges.push(TimeRange {
        start: Some(cursor),
        end: None,
    });

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_total_partition(ranges: &[TimeRange]) {
        assert!(ranges.len() >= 2);
        assert_eq!(ranges.first().unwrap().start, None);
        assert_eq!(ranges.last().unwrap().end, None);
        for pair in ranges.windows(2) {
            // Shared boundary: no gap, no overlap
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].end.is_some());
        }
    }

    #[test]
    fn test_partition_without_resume_is_total() {
        let ranges = partition(None);
        assert_total_partition(&ranges);
        // Head ends at the fixed lower bound
        assert_eq!(ranges[0].end, Some(bound_datetime(LOWER_BOUND)));
        // More than a decade of 10-day windows
        assert!(ranges.len() > 300);
    }

    #[test]
    fn test_partition_with_resume_is_total() {
        let resume = NaiveDate::from_ymd_opt(2015, 6, 1).unwrap();
        let ranges = partition(Some(resume));
        assert_total_partition(&ranges);
        assert_eq!(ranges[0].end, Some(date_start(resume)));
    }

    #[test]
    fn test_windows_are_fixed_width() {
        let resume = NaiveDate::from_ymd_opt(2021, 11, 1).unwrap();
        let ranges = partition(Some(resume));
        for range in &ranges[1..ranges.len() - 1] {
            let width = range.end.unwrap() - range.start.unwrap();
            assert_eq!(width, Duration::days(WINDOW_DAYS));
        }
    }

    #[test]
    fn test_resume_past_upper_bound_yields_head_and_tail_only() {
        let resume = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let ranges = partition(Some(resume));
        assert_eq!(ranges.len(), 2);
        assert_total_partition(&ranges);
    }

    #[test]
    fn test_windows_stop_at_first_boundary_past_upper_bound() {
        let ranges = partition(None);
        let tail = ranges.last().unwrap();
        let upper = bound_datetime(UPPER_BOUND);
        let start = tail.start.unwrap();
        assert!(start >= upper);
        assert!(start - upper < Duration::days(WINDOW_DAYS));
    }

    #[test]
    fn test_contains_half_open() {
        let range = TimeRange {
            start: Some(bound_datetime((2015, 1, 1))),
            end: Some(bound_datetime((2015, 1, 11))),
        };
        assert!(range.contains(bound_datetime((2015, 1, 1))));
        assert!(range.contains(bound_datetime((2015, 1, 10))));
        assert!(!range.contains(bound_datetime((2015, 1, 11))));
        assert!(!range.contains(bound_datetime((2014, 12, 31))));
    }

    #[test]
    fn test_every_instant_covered_exactly_once() {
        let samples = [
            bound_datetime((1995, 7, 4)),
            bound_datetime((2010, 1, 1)),
            bound_datetime((2016, 2, 29)),
            bound_datetime((2022, 1, 1)),
            bound_datetime((2030, 12, 25)),
        ];
        for resume in [None, Some(NaiveDate::from_ymd_opt(2013, 2, 10).unwrap())] {
            let ranges = partition(resume);
            for sample in samples {
                let covering = ranges.iter().filter(|r| r.contains(sample)).count();
                assert_eq!(covering, 1, "instant {} covered {} times", sample, covering);
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(TimeRange::all().to_string(), "[.., ..)");
        let range = TimeRange {
            start: Some(bound_datetime((2015, 1, 1))),
            end: None,
        };
        assert_eq!(range.to_string(), "[2015-01-01, ..)");
    }
}
