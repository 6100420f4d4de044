//! Basal schedule model.
//!
//! A schedule is an ordered list of rate segments addressed by offset from
//! midnight in the pod's local time. The pod programs rates in half-hour
//! buckets, so segment offsets must land on half-hour boundaries.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::Units;

/// Seconds in one half-hour scheduling bucket.
pub const SECONDS_PER_SEGMENT: i64 = 30 * 60;

/// Number of half-hour buckets in a day.
pub const SEGMENTS_PER_DAY: i64 = 48;

/// One rate segment of a basal schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasalScheduleEntry {
    /// Rate in units per hour.
    pub rate: Units,
    /// Offset from midnight at which this rate starts.
    #[serde(with = "crate::time_serde::seconds")]
    pub start_offset: Duration,
}

/// Errors building a [`BasalSchedule`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BasalScheduleError {
    /// The schedule had no entries.
    #[error("basal schedule must have at least one entry")]
    Empty,

    /// The first entry did not start at midnight.
    #[error("first basal schedule entry must start at midnight")]
    DoesNotStartAtMidnight,

    /// Entry offsets were not strictly increasing or exceeded 24 hours.
    #[error("basal schedule entry {index} has an invalid start offset")]
    InvalidOffset {
        /// Index of the offending entry.
        index: usize,
    },
}

/// A validated 24-hour basal schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalSchedule {
    entries: Vec<BasalScheduleEntry>,
}

impl BasalSchedule {
    /// Build a schedule, validating entry ordering.
    pub fn new(entries: Vec<BasalScheduleEntry>) -> Result<Self, BasalScheduleError> {
        let first = entries.first().ok_or(BasalScheduleError::Empty)?;
        if first.start_offset != Duration::zero() {
            return Err(BasalScheduleError::DoesNotStartAtMidnight);
        }
        for (index, window) in entries.windows(2).enumerate() {
            let (prev, next) = (&window[0], &window[1]);
            let secs = next.start_offset.num_seconds();
            if secs <= prev.start_offset.num_seconds()
                || secs % SECONDS_PER_SEGMENT != 0
                || secs >= SECONDS_PER_SEGMENT * SEGMENTS_PER_DAY
            {
                return Err(BasalScheduleError::InvalidOffset { index: index + 1 });
            }
        }
        Ok(Self { entries })
    }

    /// A flat schedule delivering `rate` all day.
    #[must_use]
    pub fn single_rate(rate: Units) -> Self {
        Self {
            entries: vec![BasalScheduleEntry {
                rate,
                start_offset: Duration::zero(),
            }],
        }
    }

    /// The validated entries, in start-offset order.
    #[must_use]
    pub fn entries(&self) -> &[BasalScheduleEntry] {
        &self.entries
    }

    /// The rate in effect at `offset` from midnight.
    #[must_use]
    pub fn rate_at(&self, offset: Duration) -> Units {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.start_offset <= offset)
            .map_or_else(|| self.entries[0].rate, |entry| entry.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_rate_schedule() -> BasalSchedule {
        BasalSchedule::new(vec![
            BasalScheduleEntry {
                rate: Units::new(0.8),
                start_offset: Duration::zero(),
            },
            BasalScheduleEntry {
                rate: Units::new(1.2),
                start_offset: Duration::hours(8),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_rate_lookup() {
        let schedule = two_rate_schedule();
        assert_eq!(schedule.rate_at(Duration::zero()), Units::new(0.8));
        assert_eq!(schedule.rate_at(Duration::hours(7)), Units::new(0.8));
        assert_eq!(schedule.rate_at(Duration::hours(8)), Units::new(1.2));
        assert_eq!(schedule.rate_at(Duration::hours(23)), Units::new(1.2));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(BasalSchedule::new(vec![]), Err(BasalScheduleError::Empty));
    }

    #[test]
    fn test_rejects_late_start() {
        let result = BasalSchedule::new(vec![BasalScheduleEntry {
            rate: Units::new(1.0),
            start_offset: Duration::hours(1),
        }]);
        assert_eq!(result, Err(BasalScheduleError::DoesNotStartAtMidnight));
    }

    #[test]
    fn test_rejects_unordered_entries() {
        let result = BasalSchedule::new(vec![
            BasalScheduleEntry {
                rate: Units::new(1.0),
                start_offset: Duration::zero(),
            },
            BasalScheduleEntry {
                rate: Units::new(0.5),
                start_offset: Duration::hours(10),
            },
            BasalScheduleEntry {
                rate: Units::new(0.7),
                start_offset: Duration::hours(6),
            },
        ]);
        assert_eq!(result, Err(BasalScheduleError::InvalidOffset { index: 2 }));
    }

    #[test]
    fn test_rejects_off_grid_offset() {
        let result = BasalSchedule::new(vec![
            BasalScheduleEntry {
                rate: Units::new(1.0),
                start_offset: Duration::zero(),
            },
            BasalScheduleEntry {
                rate: Units::new(0.5),
                start_offset: Duration::minutes(45),
            },
        ]);
        assert_eq!(result, Err(BasalScheduleError::InvalidOffset { index: 1 }));
    }
}
