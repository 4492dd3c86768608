//! Event lookup by id.
//!
//! Retry bookkeeping only stores the event's identity, never its body. When
//! a retry is resumed in the background the original event is fetched from
//! wherever the pipeline keeps it (an event store, a queue with replay, ...)
//! through this trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rebound_core::EventId;

use crate::EventEnvelope;

/// Loads events by id.
pub trait EventLoader: Send + Sync {
    /// Returns `Ok(None)` if the event is unknown.
    fn load(&self, event_id: EventId) -> anyhow::Result<Option<EventEnvelope>>;
}

impl<T> EventLoader for Arc<T>
where
    T: EventLoader + ?Sized,
{
    fn load(&self, event_id: EventId) -> anyhow::Result<Option<EventEnvelope>> {
        (**self).load(event_id)
    }
}

/// In-memory event lookup for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEventLoader {
    events: RwLock<HashMap<EventId, EventEnvelope>>,
}

impl InMemoryEventLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, event: EventEnvelope) {
        self.events.write().unwrap().insert(event.event_id(), event);
    }

    pub fn remove(&self, event_id: EventId) -> Option<EventEnvelope> {
        self.events.write().unwrap().remove(&event_id)
    }
}

impl EventLoader for InMemoryEventLoader {
    fn load(&self, event_id: EventId) -> anyhow::Result<Option<EventEnvelope>> {
        Ok(self.events.read().unwrap().get(&event_id).cloned())
    }
}
