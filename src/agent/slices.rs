use std::time::Duration;

use chrono::{DateTime, Utc};

/// Half-open `[start, end)` replay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlice {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Lazily splits a range into consecutive slices of fixed width.
///
/// The final slice is clipped to the range end.
#[derive(Debug, Clone)]
pub struct TimeSlices {
    next: DateTime<Utc>,
    end: DateTime<Utc>,
    step: chrono::Duration,
}

impl TimeSlices {
    /// Returns `None` if `step` is zero or too large to represent.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Option<Self> {
        let step = chrono::Duration::from_std(step).ok()?;
        if step <= chrono::Duration::zero() {
            return None;
        }
        Some(Self {
            next: start,
            end,
            step,
        })
    }
}

impl Iterator for TimeSlices {
    type Item = TimeSlice;

    fn next(&mut self) -> Option<TimeSlice> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = (start + self.step).min(self.end);
        self.next = end;
        Some(TimeSlice { start, end })
    }
}
