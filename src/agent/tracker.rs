use std::time::{Duration, Instant};

use crate::sink::http::DeliveryOutcome;

/// Cumulative counters for one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Chunks accepted by the endpoint (or built, in testing mode).
    pub chunks_sent: u64,
    pub chunks_failed: u64,
    pub rows_sent: u64,
    pub entries_parsed: u64,
    pub entries_skipped: u64,
    pub elapsed: Duration,
}

/// Accumulates counters while an agent runs.
#[derive(Debug)]
pub struct RunTracker {
    started: Instant,
    summary: RunSummary,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            summary: RunSummary::default(),
        }
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_parsed(&mut self, count: usize) {
        self.summary.entries_parsed += count as u64;
    }

    pub fn record_skipped(&mut self, count: usize) {
        self.summary.entries_skipped += count as u64;
    }

    /// Records the outcome of one chunk of `rows` rows.
    pub fn record_chunk(&mut self, outcome: DeliveryOutcome, rows: usize) {
        match outcome {
            DeliveryOutcome::Delivered | DeliveryOutcome::DryRun => {
                self.summary.chunks_sent += 1;
                self.summary.rows_sent += rows as u64;
            }
            DeliveryOutcome::Failed => self.summary.chunks_failed += 1,
        }
    }

    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            elapsed: self.started.elapsed(),
            ..self.summary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_chunks() {
        let mut t = RunTracker::new();
        t.record_chunk(DeliveryOutcome::Delivered, 100);
        t.record_chunk(DeliveryOutcome::DryRun, 5);
        t.record_chunk(DeliveryOutcome::Failed, 40);
        t.record_parsed(2);
        t.record_skipped(1);

        let s = t.snapshot();
        assert_eq!(s.chunks_sent, 2);
        assert_eq!(s.chunks_failed, 1);
        assert_eq!(s.rows_sent, 105);
        assert_eq!(s.entries_parsed, 2);
        assert_eq!(s.entries_skipped, 1);
    }
}
