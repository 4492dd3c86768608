#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::bail;
use chrono::{DateTime, Utc};
use rebound_core::{AggregateId, EventId};
use rebound_events::{EventEnvelope, InMemoryDeadLetterQueue, InMemoryEventLoader};

use rebound_engine::{InMemoryRetryStore, ManualClock, RetryConfig, RetryService};

pub type Service = RetryService<Arc<InMemoryRetryStore>>;

/// Shared collaborators for a service under test.
pub struct Fixture {
    pub store: Arc<InMemoryRetryStore>,
    pub dlq: Arc<InMemoryDeadLetterQueue>,
    pub loader: Arc<InMemoryEventLoader>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new() -> Self {
        rebound_observability::init_with_filter("rebound_engine=debug");
        Self {
            store: InMemoryRetryStore::arc(),
            dlq: InMemoryDeadLetterQueue::arc(),
            loader: InMemoryEventLoader::arc(),
            clock: ManualClock::arc(start_time()),
        }
    }

    pub fn builder(&self) -> rebound_engine::RetryServiceBuilder<Arc<InMemoryRetryStore>> {
        RetryService::builder(self.store.clone(), self.dlq.clone(), self.loader.clone())
            .clock(self.clock.clone())
            .config(RetryConfig::default())
    }

    /// Build an event and make it loadable for the reconciler.
    pub fn publish(&self, event_type: &str) -> EventEnvelope {
        let event = EventEnvelope::new(
            EventId::new(),
            event_type,
            AggregateId::new(),
            serde_json::json!({"type": event_type}),
        );
        self.loader.insert(event.clone());
        event
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Processor failing `failures` times, then succeeding. Counts calls.
pub fn flaky(
    failures: u32,
    calls: Arc<AtomicU32>,
) -> impl Fn(&EventEnvelope) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static {
    move |_: &EventEnvelope| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            bail!("transient failure #{call}");
        }
        Ok(serde_json::json!({"call": call}))
    }
}

pub fn always_failing(
    calls: Arc<AtomicU32>,
) -> impl Fn(&EventEnvelope) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static {
    flaky(u32::MAX, calls)
}

/// Processor that panics on its first call and succeeds afterwards.
pub fn panics_once(
    calls: Arc<AtomicU32>,
) -> impl Fn(&EventEnvelope) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static {
    move |_: &EventEnvelope| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            panic!("worker died mid-attempt");
        }
        Ok(serde_json::json!({"call": call}))
    }
}
