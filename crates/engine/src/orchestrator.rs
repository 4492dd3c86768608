//! Retry orchestrator: drives the attempt loop for a single event.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending --(first attempt)--> Retrying --(success)--> Succeeded (record deleted)
//! Retrying --(retryable failure, budget left)--> Retrying (next_retry_at advanced)
//! Retrying --(fatal failure | budget spent)--> DeadLetter (handoff ok) | Failed (handoff failed)
//! ```
//!
//! Every step is persisted through the [`RetryStore`] before the next one
//! starts, so attempt N+1 never begins before attempt N's outcome is durable.
//!
//! ## Modes
//!
//! - [`ExecutionMode::Deferred`] (default): after scheduling a retry the call
//!   returns; the reconciler resumes the event when it is due.
//! - [`ExecutionMode::Blocking`]: the caller is suspended for the backoff
//!   delay and the loop continues in place. Only suitable for dedicated
//!   workers that can afford to block for the whole retry horizon.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use rebound_core::EventId;
use rebound_events::{DeadLetterEntry, DeadLetterSink, EventEnvelope, EventProcessor};

use crate::clock::{Clock, after, elapsed};
use crate::error::OrchestrationError;
use crate::policy::RetryPolicy;
use crate::record::{RetryRecord, RetryStatus};
use crate::store::RetryStore;

/// How the orchestrator waits out a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Schedule the retry and return; the reconciler resumes it.
    #[default]
    Deferred,
    /// Sleep through the delay and retry in the caller's thread.
    Blocking,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,
    /// Keep `Succeeded` records (until retention cleanup) instead of deleting them
    pub retain_succeeded: bool,
    /// How long a started attempt may run before the record becomes due
    /// again; recovers attempts whose process died mid-flight
    pub attempt_lease: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            retain_succeeded: false,
            attempt_lease: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retain_succeeded(mut self, retain: bool) -> Self {
        self.retain_succeeded = retain;
        self
    }

    pub fn with_attempt_lease(mut self, lease: Duration) -> Self {
        self.attempt_lease = lease;
        self
    }
}

/// What happened to an event during an orchestration call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The processor succeeded; carries its result.
    Succeeded(serde_json::Value),
    /// The latest attempt failed and another one is scheduled.
    Scheduled {
        next_retry_at: DateTime<Utc>,
        error: Option<String>,
    },
    /// Given up on and parked in the dead-letter sink.
    DeadLettered { error: String },
    /// Given up on and the dead-letter handoff failed too.
    Failed { error: String, handoff_error: String },
    /// The event had already reached a terminal status; nothing was run.
    AlreadyCompleted { status: RetryStatus },
}

/// Result of an orchestration call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult {
    pub outcome: RetryOutcome,
    /// Attempts made for the event so far (across all calls)
    pub attempts: u32,
    /// Time spent in this call
    pub total_time: Duration,
}

impl RetryResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            RetryOutcome::Succeeded(_)
                | RetryOutcome::AlreadyCompleted {
                    status: RetryStatus::Succeeded
                }
        )
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            RetryOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RetryOutcome::Scheduled { error, .. } => error.as_deref(),
            RetryOutcome::DeadLettered { error } | RetryOutcome::Failed { error, .. } => {
                Some(error)
            }
            RetryOutcome::Succeeded(_) | RetryOutcome::AlreadyCompleted { .. } => None,
        }
    }
}

/// Events currently being driven in this process.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<EventId>>);

impl InFlight {
    fn try_acquire(&self, event_id: EventId) -> Option<InFlightGuard<'_>> {
        if !self.0.lock().unwrap().insert(event_id) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: self,
            event_id,
        })
    }

    fn contains(&self, event_id: EventId) -> bool {
        self.0.lock().unwrap().contains(&event_id)
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    event_id: EventId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.in_flight.0.lock() {
            ids.remove(&self.event_id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Caller submission: honour a pending backoff.
    Submit,
    /// Reconciler resumption: the record was claimed as due.
    Resume,
}

/// Drives retries for individual events.
pub struct RetryOrchestrator<S: RetryStore> {
    store: S,
    sink: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    in_flight: InFlight,
}

impl<S: RetryStore> RetryOrchestrator<S> {
    pub fn new(store: S, sink: Arc<dyn DeadLetterSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sink,
            clock,
            config: OrchestratorConfig::default(),
            in_flight: InFlight::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Whether an event is currently being driven by this orchestrator.
    pub fn is_in_flight(&self, event_id: EventId) -> bool {
        self.in_flight.contains(event_id)
    }

    /// Process `event` with retries.
    ///
    /// Resubmitting an event that already has a non-terminal record reuses
    /// it: the attempt count is never reset and a pending backoff is honoured.
    /// Processor failures are reported in the returned [`RetryResult`]; an
    /// `Err` means the orchestration itself failed (store unavailable,
    /// invalid policy, or the event is already being driven).
    pub fn execute_with_retry<P>(
        &self,
        event: &EventEnvelope,
        processor: &P,
        policy: &RetryPolicy,
    ) -> Result<RetryResult, OrchestrationError>
    where
        P: EventProcessor + ?Sized,
    {
        self.drive(event, processor, policy, Entry::Submit)
    }

    /// Continue a retry the reconciler found due, without waiting for its
    /// due time.
    pub fn resume<P>(
        &self,
        event: &EventEnvelope,
        processor: &P,
        policy: &RetryPolicy,
    ) -> Result<RetryResult, OrchestrationError>
    where
        P: EventProcessor + ?Sized,
    {
        self.drive(event, processor, policy, Entry::Resume)
    }

    /// Finalize a retrying record as `Failed` without running anything.
    ///
    /// Used when an event can no longer be processed or parked (e.g. it
    /// vanished from the upstream store). Returns `None` if there is no
    /// non-terminal record for the event.
    pub fn abandon(
        &self,
        event_id: EventId,
        reason: &str,
    ) -> Result<Option<RetryRecord>, OrchestrationError> {
        let _guard = self
            .in_flight
            .try_acquire(event_id)
            .ok_or(OrchestrationError::AlreadyInFlight(event_id))?;

        let Some(mut record) = self.store.find_by_event_id(event_id)? else {
            return Ok(None);
        };
        if record.is_terminal() {
            return Ok(None);
        }

        record.last_error = Some(reason.to_string());
        self.store.save(&record)?;
        let record = self.store.update_status(event_id, RetryStatus::Failed)?;
        error!(event_id = %event_id, reason, "retry abandoned");
        Ok(Some(record))
    }

    fn drive<P>(
        &self,
        event: &EventEnvelope,
        processor: &P,
        policy: &RetryPolicy,
        entry: Entry,
    ) -> Result<RetryResult, OrchestrationError>
    where
        P: EventProcessor + ?Sized,
    {
        policy.validate()?;

        let event_id = event.event_id();
        let _guard = self
            .in_flight
            .try_acquire(event_id)
            .ok_or(OrchestrationError::AlreadyInFlight(event_id))?;
        let started = self.clock.now();

        let mut record = match self.store.find_by_event_id(event_id)? {
            Some(existing) if existing.is_terminal() => {
                debug!(event_id = %event_id, status = %existing.status, "event already completed");
                return Ok(RetryResult {
                    outcome: RetryOutcome::AlreadyCompleted {
                        status: existing.status,
                    },
                    attempts: existing.attempts,
                    total_time: Duration::ZERO,
                });
            }
            Some(existing) => {
                debug!(
                    event_id = %event_id,
                    attempts = existing.attempts,
                    status = %existing.status,
                    "reusing retry record"
                );
                existing
            }
            None => {
                let record = RetryRecord::new(event, policy.max_attempts, started);
                self.store.save(&record)?;
                record
            }
        };

        let mut honour_due_time = entry == Entry::Submit;
        loop {
            if record.budget_exhausted() {
                // Budget spent by an earlier flow that never finalized.
                let error = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry budget exhausted".to_string());
                return self.finalize(event, record, error, started);
            }

            if honour_due_time {
                let now = self.clock.now();
                if let Some(due) = record.next_retry_at.filter(|due| *due > now) {
                    match self.config.mode {
                        ExecutionMode::Deferred => return Ok(self.scheduled(&record, due, started)),
                        ExecutionMode::Blocking => self.clock.sleep(elapsed(now, due)),
                    }
                }
            }
            honour_due_time = true;

            record = self
                .store
                .increment_attempts(event_id, None, self.clock.now())?;
            let attempt = record.attempts;
            // Due again once the lease runs out unless this attempt records
            // an outcome first.
            record.schedule_retry(after(self.clock.now(), self.config.attempt_lease));
            self.store.save(&record)?;
            debug!(
                event_id = %event_id,
                event_type = event.event_type(),
                attempt,
                max_attempts = record.max_attempts,
                "attempting event"
            );

            let err = match processor.process(event) {
                Ok(value) => return self.complete(record, value, started),
                Err(err) => err,
            };

            let error = format!("{err:#}");
            record.last_error = Some(error.clone());

            let retryable = policy.is_retryable(&err);
            if !retryable || record.budget_exhausted() {
                warn!(
                    event_id = %event_id,
                    attempt,
                    retryable,
                    error = %error,
                    "giving up on event"
                );
                self.store.save(&record)?;
                return self.finalize(event, record, error, started);
            }

            let delay = policy.next_delay(attempt);
            let next_retry_at = after(self.clock.now(), delay);
            record.schedule_retry(next_retry_at);
            self.store.save(&record)?;
            info!(
                event_id = %event_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                next_retry_at = %next_retry_at,
                error = %error,
                "attempt failed; retry scheduled"
            );

            match self.config.mode {
                ExecutionMode::Deferred => {
                    return Ok(self.scheduled(&record, next_retry_at, started));
                }
                ExecutionMode::Blocking => self.clock.sleep(delay),
            }
        }
    }

    fn complete(
        &self,
        record: RetryRecord,
        value: serde_json::Value,
        started: DateTime<Utc>,
    ) -> Result<RetryResult, OrchestrationError> {
        let event_id = record.event_id;
        self.store.update_status(event_id, RetryStatus::Succeeded)?;
        if !self.config.retain_succeeded {
            self.store.delete(event_id)?;
        }
        info!(event_id = %event_id, attempts = record.attempts, "event processed");

        Ok(RetryResult {
            outcome: RetryOutcome::Succeeded(value),
            attempts: record.attempts,
            total_time: elapsed(started, self.clock.now()),
        })
    }

    fn finalize(
        &self,
        event: &EventEnvelope,
        mut record: RetryRecord,
        error: String,
        started: DateTime<Utc>,
    ) -> Result<RetryResult, OrchestrationError> {
        let event_id = record.event_id;
        let entry = DeadLetterEntry::new(event.clone(), error.clone(), record.attempts, self.clock.now());

        let outcome = match self.sink.send(entry) {
            Ok(()) => {
                self.store.update_status(event_id, RetryStatus::DeadLetter)?;
                warn!(event_id = %event_id, attempts = record.attempts, "event dead-lettered");
                RetryOutcome::DeadLettered { error }
            }
            Err(handoff) => {
                let handoff_error = format!("{handoff:#}");
                record.last_error = Some(format!("{error}; dead-letter handoff failed: {handoff_error}"));
                self.store.save(&record)?;
                self.store.update_status(event_id, RetryStatus::Failed)?;
                error!(
                    event_id = %event_id,
                    attempts = record.attempts,
                    error = %error,
                    handoff_error = %handoff_error,
                    "dead-letter handoff failed; event is unparked"
                );
                RetryOutcome::Failed {
                    error,
                    handoff_error,
                }
            }
        };

        Ok(RetryResult {
            outcome,
            attempts: record.attempts,
            total_time: elapsed(started, self.clock.now()),
        })
    }

    fn scheduled(
        &self,
        record: &RetryRecord,
        next_retry_at: DateTime<Utc>,
        started: DateTime<Utc>,
    ) -> RetryResult {
        RetryResult {
            outcome: RetryOutcome::Scheduled {
                next_retry_at,
                error: record.last_error.clone(),
            },
            attempts: record.attempts,
            total_time: elapsed(started, self.clock.now()),
        }
    }
}
