//! Processor registry.
//!
//! Retry bookkeeping only stores an event's identity and type, never the
//! closure that processes it. To resume a retry in the background the
//! reconciler looks the processor (and the policy it was submitted with) up
//! here by `event_type`.

use std::collections::HashMap;
use std::sync::Arc;

use rebound_events::EventProcessor;

use crate::policy::RetryPolicy;

/// A processor together with the policy it runs under.
#[derive(Clone)]
pub struct Registration {
    pub processor: Arc<dyn EventProcessor>,
    pub policy: RetryPolicy,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Maps event types to processors.
///
/// Lookup order for an event type:
/// 1. exact match (`"order.placed"`)
/// 2. category match (`"order.*"` matches `"order.placed"`), longest prefix wins
/// 3. wildcard (`"*"`)
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    registrations: HashMap<String, Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for an event type pattern, replacing any previous one.
    pub fn register<P>(&mut self, pattern: impl Into<String>, processor: P, policy: RetryPolicy)
    where
        P: EventProcessor + 'static,
    {
        self.register_arc(pattern, Arc::new(processor), policy);
    }

    pub fn register_arc(
        &mut self,
        pattern: impl Into<String>,
        processor: Arc<dyn EventProcessor>,
        policy: RetryPolicy,
    ) {
        self.registrations
            .insert(pattern.into(), Registration { processor, policy });
    }

    pub fn lookup(&self, event_type: &str) -> Option<&Registration> {
        if let Some(r) = self.registrations.get(event_type) {
            return Some(r);
        }

        let category = self
            .registrations
            .iter()
            .filter_map(|(pattern, r)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = event_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), r))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, r)| r);
        if category.is_some() {
            return category;
        }

        self.registrations.get("*")
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
