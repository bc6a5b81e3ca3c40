//! Half-open time ranges used to window candle datasets.

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` over candle open times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    /// Returns `None` when `end <= start`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t < self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if `other` falls entirely within this range.
    pub fn covers(&self, other: &DateRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Sub-range of this range: `[start + offset, start + offset + len)`,
    /// clipped to `end`. Returns `None` when the window would be empty.
    pub fn window(&self, offset: Duration, len: Duration) -> Option<DateRange> {
        let start = self.start + offset;
        let end = (start + len).min(self.end);
        DateRange::new(start, end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
