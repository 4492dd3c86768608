use crate::EventEnvelope;

/// Business logic invoked once per attempt.
///
/// Processors are supplied by the caller and are the only place domain work
/// happens. The engine makes no assumption about what they do; it only needs:
///
/// - an `Ok` value on success (returned to the caller unchanged)
/// - an error on failure, which the retry policy classifies as retryable or not
///
/// Because an event may be attempted more than once (and may be redelivered by
/// the upstream source), processors must be idempotent. They are also expected
/// to enforce their own timeouts; the engine never interrupts an attempt.
pub trait EventProcessor: Send + Sync {
    fn process(&self, event: &EventEnvelope) -> anyhow::Result<serde_json::Value>;
}

impl<F> EventProcessor for F
where
    F: Fn(&EventEnvelope) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    fn process(&self, event: &EventEnvelope) -> anyhow::Result<serde_json::Value> {
        self(event)
    }
}
