//! Retry bookkeeping for a single event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rebound_core::{AggregateId, EventId, OriginatorId};
use rebound_events::{EventEnvelope, Metadata};

/// Lifecycle status of a retry record.
///
/// ```text
/// Pending --(first attempt)--> Retrying --(success)--> Succeeded
/// Retrying --(retryable failure)--> Retrying
/// Retrying --(fatal failure / budget spent)--> DeadLetter | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Created, no attempt made yet
    Pending,
    /// At least one attempt made; more may follow
    Retrying,
    /// Processed successfully
    Succeeded,
    /// Could not be processed and could not be parked either
    Failed,
    /// Parked in the dead-letter sink
    DeadLetter,
}

impl RetryStatus {
    pub const ALL: [RetryStatus; 5] = [
        RetryStatus::Pending,
        RetryStatus::Retrying,
        RetryStatus::Succeeded,
        RetryStatus::Failed,
        RetryStatus::DeadLetter,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryStatus::Succeeded | RetryStatus::Failed | RetryStatus::DeadLetter
        )
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Staying in the same status is always allowed (re-saving a record).
    pub fn can_transition_to(&self, next: RetryStatus) -> bool {
        use RetryStatus::*;

        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Retrying) | (Retrying, Succeeded | Failed | DeadLetter)
        )
    }

    /// Statuses a record may be in right before entering `self`.
    pub fn predecessors(&self) -> Vec<RetryStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Retrying => "retrying",
            RetryStatus::Succeeded => "succeeded",
            RetryStatus::Failed => "failed",
            RetryStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per event identity; tracks attempt progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub originator_id: Option<OriginatorId>,
    /// Attempts made so far (never above `max_attempts`)
    pub attempts: u32,
    /// Attempt budget captured from the policy when the record was created
    pub max_attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// When the next attempt is due; only set while `Retrying`
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: RetryStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RetryRecord {
    /// Create bookkeeping for an event about to be attempted for the first time.
    pub fn new(event: &EventEnvelope, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            originator_id: event.originator_id(),
            attempts: 0,
            max_attempts,
            first_attempt_at: now,
            last_attempt_at: now,
            next_retry_at: None,
            last_error: None,
            status: RetryStatus::Pending,
            metadata: event.metadata().clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Due for another attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Retrying && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Count one attempt started at `at`.
    ///
    /// Returns `false` (and changes nothing) if the budget is spent or the
    /// record is terminal.
    pub fn record_attempt(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.budget_exhausted() {
            return false;
        }
        self.attempts += 1;
        self.last_attempt_at = self.last_attempt_at.max(at);
        if self.status == RetryStatus::Pending {
            self.status = RetryStatus::Retrying;
        }
        true
    }

    /// Schedule the next attempt.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.status = RetryStatus::Retrying;
        self.next_retry_at = Some(at);
    }

    /// Move to `status`, keeping `next_retry_at` consistent with it.
    ///
    /// Returns `false` (and changes nothing) for a transition the lifecycle
    /// does not allow.
    pub fn transition_to(&mut self, status: RetryStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        if status != RetryStatus::Retrying {
            self.next_retry_at = None;
        }
        true
    }
}
