use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use rebound_core::EventId;

use super::{RetryStore, StoreError};
use crate::clock::after;
use crate::record::{RetryRecord, RetryStatus};
use crate::stats::RetryStats;

/// In-memory retry store for tests/dev.
///
/// Every mutation runs under a single write lock, so per-record updates are
/// atomic. Contents are lost on restart; use [`super::PostgresRetryStore`]
/// when retries must survive the process.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    records: RwLock<HashMap<EventId, RetryRecord>>,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn due_sorted(records: &HashMap<EventId, RetryRecord>, now: DateTime<Utc>) -> Vec<EventId> {
    let mut due: Vec<_> = records.values().filter(|r| r.is_due(now)).collect();
    due.sort_by_key(|r| (r.next_retry_at, r.event_id));
    due.into_iter().map(|r| r.event_id).collect()
}

impl RetryStore for InMemoryRetryStore {
    fn save(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get(&record.event_id) {
            if !existing.status.can_transition_to(record.status) {
                return Err(StoreError::InvalidTransition {
                    event_id: record.event_id,
                    from: existing.status,
                    to: record.status,
                });
            }
        }
        records.insert(record.event_id, record.clone());
        Ok(())
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, StoreError> {
        Ok(self.records.read().unwrap().get(&event_id).cloned())
    }

    fn delete(&self, event_id: EventId) -> Result<bool, StoreError> {
        Ok(self.records.write().unwrap().remove(&event_id).is_some())
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let records = self.records.read().unwrap();
        Ok(due_sorted(&records, now)
            .into_iter()
            .filter_map(|id| records.get(&id).cloned())
            .collect())
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        let mut records = self.records.write().unwrap();
        let lease_until = after(now, lease);

        let mut claimed = Vec::new();
        for id in due_sorted(&records, now).into_iter().take(limit) {
            if let Some(record) = records.get_mut(&id) {
                record.next_retry_at = Some(lease_until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    fn increment_attempts(
        &self,
        event_id: EventId,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RetryRecord, StoreError> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(&event_id)
            .ok_or(StoreError::NotFound(event_id))?;

        if record.is_terminal() {
            return Err(StoreError::InvalidTransition {
                event_id,
                from: record.status,
                to: RetryStatus::Retrying,
            });
        }
        if !record.record_attempt(at) {
            return Err(StoreError::AttemptBudgetExhausted {
                event_id,
                max_attempts: record.max_attempts,
            });
        }
        if let Some(error) = error {
            record.last_error = Some(error.to_string());
        }
        Ok(record.clone())
    }

    fn update_status(
        &self,
        event_id: EventId,
        status: RetryStatus,
    ) -> Result<RetryRecord, StoreError> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(&event_id)
            .ok_or(StoreError::NotFound(event_id))?;

        let from = record.status;
        if !record.transition_to(status) {
            return Err(StoreError::InvalidTransition {
                event_id,
                from,
                to: status,
            });
        }
        Ok(record.clone())
    }

    fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, r| !(r.is_terminal() && r.last_attempt_at < cutoff));
        Ok(before - records.len())
    }

    fn get_statistics(&self) -> Result<RetryStats, StoreError> {
        Ok(self.records.read().unwrap().values().collect())
    }
}
