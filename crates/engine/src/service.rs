//! Composition root: wires store, orchestrator, registry and reconciler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use rebound_events::{DeadLetterSink, EventEnvelope, EventLoader, EventProcessor};

use crate::clock::{Clock, SystemClock, before};
use crate::config::RetryConfig;
use crate::error::OrchestrationError;
use crate::orchestrator::{RetryOrchestrator, RetryResult};
use crate::policy::RetryPolicy;
use crate::reconciler::{Reconciler, ReconcilerHandle, SweepReport};
use crate::registry::ProcessorRegistry;
use crate::stats::RetryStats;
use crate::store::RetryStore;

/// Builder for [`RetryService`].
pub struct RetryServiceBuilder<S: RetryStore> {
    store: S,
    sink: Arc<dyn DeadLetterSink>,
    loader: Arc<dyn EventLoader>,
    clock: Arc<dyn Clock>,
    registry: ProcessorRegistry,
    config: RetryConfig,
}

impl<S: RetryStore + 'static> RetryServiceBuilder<S> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a processor under the configured default policy.
    pub fn processor<P>(mut self, pattern: impl Into<String>, processor: P) -> Self
    where
        P: EventProcessor + 'static,
    {
        let policy = self.config.default_policy();
        self.registry.register(pattern, processor, policy);
        self
    }

    pub fn processor_with_policy<P>(
        mut self,
        pattern: impl Into<String>,
        processor: P,
        policy: RetryPolicy,
    ) -> Self
    where
        P: EventProcessor + 'static,
    {
        self.registry.register(pattern, processor, policy);
        self
    }

    /// Build the service. The reconciler is not started; call
    /// [`RetryService::start`].
    pub fn build(self) -> RetryService<S> {
        let orchestrator = Arc::new(
            RetryOrchestrator::new(self.store, self.sink, self.clock)
                .with_config(self.config.orchestrator_config()),
        );
        let registry = Arc::new(self.registry);
        let reconciler = Reconciler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
            self.loader,
            self.config.reconciler_config(),
        );

        RetryService {
            orchestrator,
            registry,
            reconciler,
            handle: Mutex::new(None),
            retention: self.config.retention(),
        }
    }
}

/// Retry engine facade.
pub struct RetryService<S: RetryStore> {
    orchestrator: Arc<RetryOrchestrator<S>>,
    registry: Arc<ProcessorRegistry>,
    reconciler: Reconciler<S>,
    handle: Mutex<Option<ReconcilerHandle>>,
    retention: Duration,
}

impl<S: RetryStore + 'static> RetryService<S> {
    pub fn builder(
        store: S,
        sink: Arc<dyn DeadLetterSink>,
        loader: Arc<dyn EventLoader>,
    ) -> RetryServiceBuilder<S> {
        RetryServiceBuilder {
            store,
            sink,
            loader,
            clock: Arc::new(SystemClock),
            registry: ProcessorRegistry::new(),
            config: RetryConfig::default(),
        }
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator<S> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Process `event` with an explicit processor and policy.
    pub fn execute_with_retry<P>(
        &self,
        event: &EventEnvelope,
        processor: &P,
        policy: &RetryPolicy,
    ) -> Result<RetryResult, OrchestrationError>
    where
        P: EventProcessor + ?Sized,
    {
        self.orchestrator.execute_with_retry(event, processor, policy)
    }

    /// Process `event` with the processor registered for its type.
    pub fn execute(&self, event: &EventEnvelope) -> Result<RetryResult, OrchestrationError> {
        let registration = self
            .registry
            .lookup(event.event_type())
            .ok_or_else(|| OrchestrationError::NoProcessor(event.event_type().to_string()))?;

        self.orchestrator.execute_with_retry(
            event,
            registration.processor.as_ref(),
            &registration.policy,
        )
    }

    pub fn get_retry_statistics(&self) -> Result<RetryStats, OrchestrationError> {
        Ok(self.orchestrator.store().get_statistics()?)
    }

    /// Delete terminal records whose last attempt is older than `retention`.
    pub fn cleanup_old_retry_records(&self, retention: Duration) -> Result<usize, OrchestrationError> {
        let cutoff = before(self.orchestrator.clock().now(), retention);
        let removed = self.orchestrator.store().cleanup(cutoff)?;
        info!(removed, cutoff = %cutoff, "old retry records cleaned up");
        Ok(removed)
    }

    /// Cleanup with the configured retention window.
    pub fn cleanup_expired(&self) -> Result<usize, OrchestrationError> {
        self.cleanup_old_retry_records(self.retention)
    }

    /// Run one reconciler sweep in the calling thread.
    pub fn sweep_once(&self) -> Result<SweepReport, OrchestrationError> {
        self.reconciler.sweep_once()
    }

    /// Start the background reconciler. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap();
        if handle.as_ref().is_some_and(ReconcilerHandle::is_running) {
            return false;
        }
        *handle = Some(self.reconciler.clone().spawn());
        true
    }

    /// Stop the background reconciler. Idempotent.
    pub fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(ReconcilerHandle::is_running)
    }
}

impl<S: RetryStore> Drop for RetryService<S> {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                handle.stop();
            }
        }
    }
}
