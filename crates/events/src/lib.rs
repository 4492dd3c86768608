//! Events and the collaborators that surround the retry engine.
//!
//! The engine never owns events; it receives them from the pipeline, hands
//! them to a processor, and parks the ones that cannot be processed in a
//! dead-letter sink.

pub mod dead_letter;
pub mod envelope;
pub mod loader;
pub mod processor;

pub use dead_letter::{DeadLetterEntry, DeadLetterSink, InMemoryDeadLetterQueue};
pub use envelope::{EventEnvelope, Metadata};
pub use loader::{EventLoader, InMemoryEventLoader};
pub use processor::EventProcessor;
