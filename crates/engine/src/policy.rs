//! Retry policy and backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use rebound_core::{DomainError, DomainResult};

/// Predicate deciding whether a processor error is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Retry policy configuration.
///
/// Immutable once built; passed per call. Without a classifier every error is
/// treated as retryable.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one (>= 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor between consecutive delays (>= 1.0)
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter fraction (0.0-1.0); the delay is drawn from `delay * (1 ± jitter)`
    pub jitter: f64,
    #[serde(skip)]
    classifier: Option<RetryClassifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("classifier", &self.classifier.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            classifier: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
            classifier: None,
        }
    }

    /// Create a policy with exponential backoff (factor 2, 10% jitter).
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.1,
            classifier: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Install an error classifier; returning `false` sends the event straight
    /// to the dead-letter sink.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Treat any error whose cause chain contains an `E` as non-retryable.
    pub fn fatal_on<E>(self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.with_classifier(|err| !err.chain().any(|cause| cause.is::<E>()))
    }

    /// Check the policy's invariants.
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts < 1 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DomainError::validation(format!(
                "multiplier must be a finite value >= 1.0 (got {})",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(DomainError::validation(format!(
                "max_delay ({:?}) must not be below base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DomainError::validation(format!(
                "jitter must be within 0.0..=1.0 (got {})",
                self.jitter
            )));
        }
        Ok(())
    }

    pub fn is_retryable(&self, error: &anyhow::Error) -> bool {
        self.classifier.as_ref().is_none_or(|classify| classify(error))
    }

    /// Backoff before the attempt following the `attempt`-th failure
    /// (1-indexed), without jitter.
    ///
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_ns = self.base_delay.as_nanos() as f64;
        let max_ns = self.max_delay.as_nanos() as f64;
        let exp = self.multiplier.powi((attempt - 1).min(i32::MAX as u32) as i32);
        let delay_ns = (base_ns * exp).min(max_ns);

        Duration::from_nanos(delay_ns as u64).min(self.max_delay)
    }

    /// Backoff with jitter drawn from the thread-local RNG.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Backoff with jitter drawn from `rng`.
    pub fn next_delay_with<R>(&self, attempt: u32, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        let delay = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let delay_ns = delay.as_nanos() as f64;
        let spread = delay_ns * jitter;
        let jittered = rng.gen_range((delay_ns - spread)..=(delay_ns + spread));

        Duration::from_nanos(jittered.max(0.0) as u64)
    }
}
