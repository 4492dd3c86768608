//! `rebound-core` — shared primitives for the retry engine.
//!
//! This crate holds identifiers and the domain error model. It has no
//! infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId, OriginatorId};
