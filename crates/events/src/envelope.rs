use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rebound_core::{AggregateId, EventId, OriginatorId};

/// Caller-supplied context that travels with an event. Opaque to the engine.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Envelope for an event submitted for processing.
///
/// Notes:
/// - `event_id` is the identity the retry engine keys its bookkeeping on;
///   redelivering the same id resumes existing bookkeeping.
/// - `event_type` selects the registered processor when a retry is resumed
///   in the background.
/// - `payload` is the domain-agnostic event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    originator_id: Option<OriginatorId>,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: Metadata,
}

impl EventEnvelope {
    pub fn new(
        event_id: EventId,
        event_type: impl Into<String>,
        aggregate_id: AggregateId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            aggregate_id,
            originator_id: None,
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn with_originator(mut self, originator_id: OriginatorId) -> Self {
        self.originator_id = Some(originator_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn originator_id(&self) -> Option<OriginatorId> {
        self.originator_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}
