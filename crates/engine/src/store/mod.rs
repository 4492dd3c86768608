//! Retry record storage.
//!
//! The store is the only shared mutable state in the engine. Callers
//! submitting events, the reconciler sweeping due records, and in-flight
//! attempts all go through it concurrently, so every read-modify-write in
//! the contract must be atomic per record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use rebound_core::EventId;

use crate::record::{RetryRecord, RetryStatus};
use crate::stats::RetryStats;

mod in_memory;
mod postgres;

pub use in_memory::InMemoryRetryStore;
pub use postgres::PostgresRetryStore;

/// Retry record store abstraction.
pub trait RetryStore: Send + Sync {
    /// Insert or replace the record for `record.event_id`.
    fn save(&self, record: &RetryRecord) -> Result<(), StoreError>;

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, StoreError>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, event_id: EventId) -> Result<bool, StoreError>;

    /// All `Retrying` records with `next_retry_at <= now`, earliest first.
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError>;

    /// Claim up to `limit` due records, oldest due time first.
    ///
    /// Claimed records have their `next_retry_at` pushed to `now + lease`
    /// in the same atomic step that selects them, so a concurrent sweep can
    /// not claim them again. If the claimer never finishes, the record
    /// becomes due again once the lease runs out.
    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError>;

    /// Count one attempt started at `at`, optionally capturing an error.
    ///
    /// Atomic. A `Pending` record moves to `Retrying`. Fails with
    /// `AttemptBudgetExhausted` instead of exceeding `max_attempts`, and with
    /// `InvalidTransition` for terminal records.
    fn increment_attempts(
        &self,
        event_id: EventId,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError>;

    /// Move a record to `status`, validating the lifecycle transition.
    fn update_status(&self, event_id: EventId, status: RetryStatus)
    -> Result<RetryRecord, StoreError>;

    /// Delete terminal records whose `last_attempt_at` is before `cutoff`.
    /// Returns the number of records removed.
    fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn get_statistics(&self) -> Result<RetryStats, StoreError>;
}

/// Retry store error.
///
/// These are infrastructure failures; the engine never retries them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("retry record not found: {0}")]
    NotFound(EventId),
    #[error("illegal status transition for {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: EventId,
        from: RetryStatus,
        to: RetryStatus,
    },
    #[error("attempt budget exhausted for {event_id} (max {max_attempts})")]
    AttemptBudgetExhausted { event_id: EventId, max_attempts: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S> RetryStore for Arc<S>
where
    S: RetryStore + ?Sized,
{
    fn save(&self, record: &RetryRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, StoreError> {
        (**self).find_by_event_id(event_id)
    }

    fn delete(&self, event_id: EventId) -> Result<bool, StoreError> {
        (**self).delete(event_id)
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        (**self).find_due(now)
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        (**self).claim_due(now, lease, limit)
    }

    fn increment_attempts(
        &self,
        event_id: EventId,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        (**self).increment_attempts(event_id, error, at)
    }

    fn update_status(
        &self,
        event_id: EventId,
        status: RetryStatus,
    ) -> Result<RetryRecord, StoreError> {
        (**self).update_status(event_id, status)
    }

    fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).cleanup(cutoff)
    }

    fn get_statistics(&self) -> Result<RetryStats, StoreError> {
        (**self).get_statistics()
    }
}
