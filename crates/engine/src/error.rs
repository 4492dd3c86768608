use rebound_core::{DomainError, EventId};

use crate::store::StoreError;

/// Failure of an orchestration call itself, as opposed to a processing
/// failure of the event (those are reported through `RetryResult`).
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// The retry store failed; the current cycle was aborted.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[from] DomainError),

    /// Another flow in this process is already driving this event.
    #[error("event {0} is already being processed")]
    AlreadyInFlight(EventId),

    #[error("no processor registered for event type {0}")]
    NoProcessor(String),
}
