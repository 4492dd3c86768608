//! Read-only rollups over retry records.
//!
//! Statistics are computed on demand from whatever the store currently
//! holds, so they are exact but only cover records that survived retention
//! cleanup.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::{RetryRecord, RetryStatus};

/// Aggregate view over all retry records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    /// Records observed (one per event)
    pub total_retries: u64,
    pub pending: u64,
    pub retrying: u64,
    pub successful: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Mean attempts across completed (terminal) records
    pub average_attempts: f64,
    pub by_event_type: BTreeMap<String, EventTypeStats>,
}

/// Per-event-type breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventTypeStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Mean attempts across completed (terminal) records of this type
    pub average_attempts: f64,
}

/// Builds [`RetryStats`] from individual records or pre-grouped counts.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    stats: RetryStats,
    completed: u64,
    completed_attempts: u64,
    per_type: BTreeMap<String, (u64, u64)>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, record: &RetryRecord) {
        self.add_group(&record.event_type, record.status, 1, u64::from(record.attempts));
    }

    /// Add `count` records of one type and status whose attempts sum to
    /// `attempts_sum`.
    pub fn add_group(&mut self, event_type: &str, status: RetryStatus, count: u64, attempts_sum: u64) {
        let stats = &mut self.stats;
        stats.total_retries += count;
        match status {
            RetryStatus::Pending => stats.pending += count,
            RetryStatus::Retrying => stats.retrying += count,
            RetryStatus::Succeeded => stats.successful += count,
            RetryStatus::Failed => stats.failed += count,
            RetryStatus::DeadLetter => stats.dead_lettered += count,
        }

        let by_type = stats.by_event_type.entry(event_type.to_string()).or_default();
        by_type.total += count;
        match status {
            RetryStatus::Succeeded => by_type.successful += count,
            RetryStatus::Failed => by_type.failed += count,
            RetryStatus::DeadLetter => by_type.dead_lettered += count,
            RetryStatus::Pending | RetryStatus::Retrying => {}
        }

        if status.is_terminal() {
            self.completed += count;
            self.completed_attempts += attempts_sum;
            let (n, sum) = self.per_type.entry(event_type.to_string()).or_default();
            *n += count;
            *sum += attempts_sum;
        }
    }

    pub fn finish(mut self) -> RetryStats {
        self.stats.average_attempts = mean(self.completed_attempts, self.completed);
        for (event_type, (n, sum)) in self.per_type {
            if let Some(by_type) = self.stats.by_event_type.get_mut(&event_type) {
                by_type.average_attempts = mean(sum, n);
            }
        }
        self.stats
    }
}

impl<'a> FromIterator<&'a RetryRecord> for RetryStats {
    fn from_iter<I: IntoIterator<Item = &'a RetryRecord>>(iter: I) -> Self {
        let mut acc = StatsAccumulator::new();
        for record in iter {
            acc.add_record(record);
        }
        acc.finish()
    }
}

fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}
