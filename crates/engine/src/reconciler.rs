//! Background reconciler.
//!
//! Periodically claims due retry records and resumes them through the
//! orchestrator. Claiming pushes each record's `next_retry_at` forward by the
//! lease, so a record whose resumption dies mid-flight is picked up again once
//! the lease expires. A processor that panics costs only its own record; the
//! sweep carries on with the rest of the batch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use rebound_events::EventLoader;

use crate::error::OrchestrationError;
use crate::orchestrator::{RetryOrchestrator, RetryOutcome};
use crate::record::RetryRecord;
use crate::registry::ProcessorRegistry;
use crate::store::RetryStore;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sweep_interval: Duration,
    /// Maximum records claimed per sweep
    pub batch_size: usize,
    /// How long a claimed record is hidden from other sweeps
    pub claim_lease: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub failed: usize,
    /// In flight elsewhere, no processor registered, or already completed
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    fn tally(&mut self, outcome: &RetryOutcome) {
        match outcome {
            RetryOutcome::Succeeded(_) => self.succeeded += 1,
            RetryOutcome::Scheduled { .. } => self.rescheduled += 1,
            RetryOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            RetryOutcome::Failed { .. } => self.failed += 1,
            RetryOutcome::AlreadyCompleted { .. } => self.skipped += 1,
        }
    }
}

/// Resumes due retries.
pub struct Reconciler<S: RetryStore> {
    orchestrator: Arc<RetryOrchestrator<S>>,
    registry: Arc<ProcessorRegistry>,
    loader: Arc<dyn EventLoader>,
    config: ReconcilerConfig,
}

impl<S: RetryStore> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            registry: Arc::clone(&self.registry),
            loader: Arc::clone(&self.loader),
            config: self.config.clone(),
        }
    }
}

impl<S: RetryStore> Reconciler<S> {
    pub fn new(
        orchestrator: Arc<RetryOrchestrator<S>>,
        registry: Arc<ProcessorRegistry>,
        loader: Arc<dyn EventLoader>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            loader,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Claim and resume one batch of due records.
    ///
    /// Failures on individual records are logged and counted; only a failure
    /// to claim aborts the sweep.
    pub fn sweep_once(&self) -> Result<SweepReport, OrchestrationError> {
        let now = self.orchestrator.clock().now();
        let claimed = self.orchestrator.store().claim_due(
            now,
            self.config.claim_lease,
            self.config.batch_size,
        )?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };
        for record in &claimed {
            let resumed =
                panic::catch_unwind(AssertUnwindSafe(|| self.resume_record(record, &mut report)));
            if let Err(payload) = resumed {
                error!(
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    panic_msg = %panic_message(payload.as_ref()),
                    "processor panicked during retry"
                );
                report.errors += 1;
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "reconciler sweep finished"
            );
        }
        Ok(report)
    }

    fn resume_record(&self, record: &RetryRecord, report: &mut SweepReport) {
        let event_id = record.event_id;

        if self.orchestrator.is_in_flight(event_id) {
            debug!(event_id = %event_id, "event in flight; skipping");
            report.skipped += 1;
            return;
        }

        let Some(registration) = self.registry.lookup(&record.event_type) else {
            // Left in place; it becomes due again when the lease expires.
            warn!(
                event_id = %event_id,
                event_type = %record.event_type,
                "no processor registered for due retry"
            );
            report.skipped += 1;
            return;
        };

        let event = match self.loader.load(event_id) {
            Ok(Some(event)) => event,
            Ok(None) => {
                match self.orchestrator.abandon(event_id, "event no longer available for retry") {
                    Ok(Some(_)) => report.failed += 1,
                    Ok(None) => report.skipped += 1,
                    Err(OrchestrationError::AlreadyInFlight(_)) => report.skipped += 1,
                    Err(err) => {
                        warn!(event_id = %event_id, error = %err, "failed to abandon retry");
                        report.errors += 1;
                    }
                }
                return;
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(event_id = %event_id, error = %error, "failed to load event for retry");
                report.errors += 1;
                return;
            }
        };

        match self
            .orchestrator
            .resume(&event, registration.processor.as_ref(), &registration.policy)
        {
            Ok(result) => report.tally(&result.outcome),
            Err(OrchestrationError::AlreadyInFlight(_)) => report.skipped += 1,
            Err(err) => {
                warn!(event_id = %event_id, error = %err, "failed to resume retry");
                report.errors += 1;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: RetryStore + 'static> Reconciler<S> {
    /// Run sweeps on a background thread until the handle is stopped.
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("rebound-reconciler".to_string())
            .spawn(move || reconciler_loop(self, shutdown_rx))
            .expect("failed to spawn reconciler thread");

        ReconcilerHandle {
            shutdown: Mutex::new(Some(shutdown_tx)),
            join: Mutex::new(Some(join)),
        }
    }
}

fn reconciler_loop<S: RetryStore>(reconciler: Reconciler<S>, shutdown_rx: mpsc::Receiver<()>) {
    info!(
        interval_ms = reconciler.config.sweep_interval.as_millis() as u64,
        batch_size = reconciler.config.batch_size,
        "reconciler started"
    );

    loop {
        if let Err(err) = reconciler.sweep_once() {
            warn!(error = %err, "reconciler sweep failed");
        }

        match shutdown_rx.recv_timeout(reconciler.config.sweep_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("reconciler stopped");
}

/// Handle to stop a running reconciler.
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReconcilerHandle {
    /// Stop sweeping and wait for the current sweep to finish. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            if join.join().is_err() {
                error!("reconciler thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|join| !join.is_finished())
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::bail;
    use chrono::Utc;
    use rebound_core::{AggregateId, EventId};
    use rebound_events::{EventEnvelope, InMemoryDeadLetterQueue, InMemoryEventLoader};

    use crate::clock::{Clock, ManualClock};
    use crate::policy::RetryPolicy;
    use crate::record::RetryStatus;
    use crate::store::InMemoryRetryStore;

    fn event(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(EventId::new(), event_type, AggregateId::new(), serde_json::json!({}))
    }

    #[test]
    fn report_tallies_outcomes() {
        let mut report = SweepReport::default();
        report.tally(&RetryOutcome::Succeeded(serde_json::Value::Null));
        report.tally(&RetryOutcome::DeadLettered {
            error: "x".to_string(),
        });
        report.tally(&RetryOutcome::AlreadyCompleted {
            status: RetryStatus::Failed,
        });

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rescheduled, 0);
    }

    #[test]
    fn unregistered_event_types_are_left_for_later() {
        let store = InMemoryRetryStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let loader = InMemoryEventLoader::arc();
        let orchestrator = Arc::new(RetryOrchestrator::new(
            store.clone(),
            InMemoryDeadLetterQueue::arc(),
            clock.clone(),
        ));

        let ev = event("unknown.thing");
        loader.insert(ev.clone());
        let failing = |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> { bail!("boom") };
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        orchestrator.execute_with_retry(&ev, &failing, &policy).unwrap();
        clock.advance(Duration::from_secs(1));

        let reconciler = Reconciler::new(
            orchestrator,
            Arc::new(ProcessorRegistry::new()),
            loader,
            ReconcilerConfig::default(),
        );
        let report = reconciler.sweep_once().unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(report.skipped, 1);
        let record = store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.status, RetryStatus::Retrying);
        assert_eq!(record.attempts, 1);
        // Claimed under lease, so not due again until it expires.
        assert!(!record.is_due(clock.now()));
    }

    #[test]
    fn vanished_events_are_failed() {
        let store = InMemoryRetryStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let orchestrator = Arc::new(RetryOrchestrator::new(
            store.clone(),
            InMemoryDeadLetterQueue::arc(),
            clock.clone(),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let mut registry = ProcessorRegistry::new();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        registry.register(
            "order.*",
            move |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> {
                counted.fetch_add(1, Ordering::SeqCst);
                bail!("still down")
            },
            policy.clone(),
        );
        let registry = Arc::new(registry);

        let ev = event("order.placed");
        let processor = registry.lookup("order.placed").unwrap().processor.clone();
        orchestrator
            .execute_with_retry(&ev, processor.as_ref(), &policy)
            .unwrap();
        clock.advance(Duration::from_secs(1));

        let reconciler = Reconciler::new(
            orchestrator,
            registry,
            InMemoryEventLoader::arc(),
            ReconcilerConfig::default(),
        );
        let report = reconciler.sweep_once().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.status, RetryStatus::Failed);
    }

    #[test]
    fn panicking_processor_does_not_abort_the_sweep() {
        let store = InMemoryRetryStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let loader = InMemoryEventLoader::arc();
        let orchestrator = Arc::new(RetryOrchestrator::new(
            store.clone(),
            InMemoryDeadLetterQueue::arc(),
            clock.clone(),
        ));
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut registry = ProcessorRegistry::new();
        registry.register(
            "order.bad",
            |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> {
                panic!("processor bug")
            },
            policy.clone(),
        );
        registry.register(
            "order.good",
            |_: &EventEnvelope| -> anyhow::Result<serde_json::Value> { Ok(serde_json::Value::Null) },
            policy.clone(),
        );

        let now = clock.now();
        let mut ids = Vec::new();
        for event_type in ["order.bad", "order.good"] {
            let ev = event(event_type);
            loader.insert(ev.clone());
            let mut record = RetryRecord::new(&ev, 3, now);
            record.record_attempt(now);
            record.schedule_retry(now);
            store.save(&record).unwrap();
            ids.push(ev.event_id());
        }

        let reconciler = Reconciler::new(
            orchestrator.clone(),
            Arc::new(registry),
            loader,
            ReconcilerConfig::default(),
        );
        let report = reconciler.sweep_once().unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.succeeded, 1);
        assert!(store.find_by_event_id(ids[1]).unwrap().is_none());
        // The panicking attempt was recorded and stays recoverable.
        let bad = store.find_by_event_id(ids[0]).unwrap().unwrap();
        assert_eq!(bad.status, RetryStatus::Retrying);
        assert_eq!(bad.attempts, 2);
        assert!(bad.next_retry_at.is_some());
        assert!(!orchestrator.is_in_flight(ids[0]));
    }

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&7u8), "unknown panic");
    }

    #[test]
    fn stop_is_idempotent() {
        let orchestrator = Arc::new(RetryOrchestrator::new(
            InMemoryRetryStore::arc(),
            InMemoryDeadLetterQueue::arc(),
            ManualClock::arc(Utc::now()),
        ));
        let handle = Reconciler::new(
            orchestrator,
            Arc::new(ProcessorRegistry::new()),
            InMemoryEventLoader::arc(),
            ReconcilerConfig {
                sweep_interval: Duration::from_millis(10),
                ..ReconcilerConfig::default()
            },
        )
        .spawn();

        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }
}
