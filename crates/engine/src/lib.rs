//! Retry engine: backoff policies, durable retry bookkeeping, dead-letter
//! handoff and the background reconciler that resumes due retries.

pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod reconciler;
pub mod record;
pub mod registry;
pub mod service;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RetryConfig;
pub use error::OrchestrationError;
pub use orchestrator::{
    ExecutionMode, OrchestratorConfig, RetryOrchestrator, RetryOutcome, RetryResult,
};
pub use policy::{RetryClassifier, RetryPolicy};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerHandle, SweepReport};
pub use record::{RetryRecord, RetryStatus};
pub use registry::{ProcessorRegistry, Registration};
pub use service::{RetryService, RetryServiceBuilder};
pub use stats::{EventTypeStats, RetryStats, StatsAccumulator};
pub use store::{InMemoryRetryStore, PostgresRetryStore, RetryStore, StoreError};
