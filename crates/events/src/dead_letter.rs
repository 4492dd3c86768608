//! Dead-letter handoff.
//!
//! Events that exhausted their retry budget (or failed with an error the
//! policy marks as fatal) are parked in a dead-letter sink for inspection or
//! replay. A sink that accepts the entry turns the outcome into an expected,
//! handled one; a sink that fails leaves the event unparked, and the engine
//! escalates it accordingly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventEnvelope;

/// Entry handed to the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: EventEnvelope,
    /// The last processing error.
    pub error: String,
    /// Attempts made before the event was given up on.
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        event: EventEnvelope,
        error: impl Into<String>,
        attempts: u32,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            error: error.into(),
            attempts,
            dead_lettered_at,
        }
    }
}

/// Durable sink for terminally-failed events.
///
/// Implementations must only return `Ok` once the entry is safely stored.
pub trait DeadLetterSink: Send + Sync {
    fn send(&self, entry: DeadLetterEntry) -> anyhow::Result<()>;
}

impl<T> DeadLetterSink for Arc<T>
where
    T: DeadLetterSink + ?Sized,
{
    fn send(&self, entry: DeadLetterEntry) -> anyhow::Result<()> {
        (**self).send(entry)
    }
}

/// In-memory dead-letter queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
    failing: AtomicBool,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make subsequent sends fail (simulates an unavailable sink).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything parked so far (e.g. for replay).
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn send(&self, entry: DeadLetterEntry) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("dead-letter queue unavailable");
        }

        tracing::debug!(
            event_id = %entry.event.event_id(),
            attempts = entry.attempts,
            "event parked in in-memory dead-letter queue"
        );
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
