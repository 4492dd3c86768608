//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::orchestrator::{ExecutionMode, OrchestratorConfig};
use crate::policy::RetryPolicy;
use crate::reconciler::ReconcilerConfig;

/// Retry engine settings.
///
/// | variable                    | default    |
/// |-----------------------------|------------|
/// | `REBOUND_MAX_ATTEMPTS`      | 5          |
/// | `REBOUND_BASE_DELAY_MS`     | 1000       |
/// | `REBOUND_MULTIPLIER`        | 2.0        |
/// | `REBOUND_MAX_DELAY_MS`      | 60000      |
/// | `REBOUND_JITTER_FRACTION`   | 0.1        |
/// | `REBOUND_SWEEP_INTERVAL_MS` | 5000       |
/// | `REBOUND_SWEEP_BATCH_SIZE`  | 100        |
/// | `REBOUND_CLAIM_LEASE_MS`    | 60000      |
/// | `REBOUND_RETENTION_DAYS`    | 30         |
/// | `REBOUND_MODE`              | `deferred` |
/// | `REBOUND_RETAIN_SUCCEEDED`  | false      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    pub sweep_interval_ms: u64,
    pub sweep_batch_size: usize,
    pub claim_lease_ms: u64,
    pub retention_days: u32,
    pub mode: ExecutionMode,
    pub retain_succeeded: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_fraction: 0.1,
            sweep_interval_ms: 5_000,
            sweep_batch_size: 100,
            claim_lease_ms: 60_000,
            retention_days: 30,
            mode: ExecutionMode::Deferred,
            retain_succeeded: false,
        }
    }
}

impl RetryConfig {
    /// Read settings from `REBOUND_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults; unparseable values are logged and
    /// ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            max_attempts: read_positive(&lookup, "REBOUND_MAX_ATTEMPTS", defaults.max_attempts),
            base_delay_ms: read_parsed(&lookup, "REBOUND_BASE_DELAY_MS", defaults.base_delay_ms),
            multiplier: read_parsed(&lookup, "REBOUND_MULTIPLIER", defaults.multiplier),
            max_delay_ms: read_parsed(&lookup, "REBOUND_MAX_DELAY_MS", defaults.max_delay_ms),
            jitter_fraction: read_parsed(&lookup, "REBOUND_JITTER_FRACTION", defaults.jitter_fraction),
            sweep_interval_ms: read_positive(&lookup, "REBOUND_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms),
            sweep_batch_size: read_positive(&lookup, "REBOUND_SWEEP_BATCH_SIZE", defaults.sweep_batch_size),
            claim_lease_ms: read_positive(&lookup, "REBOUND_CLAIM_LEASE_MS", defaults.claim_lease_ms),
            retention_days: read_parsed(&lookup, "REBOUND_RETENTION_DAYS", defaults.retention_days),
            mode: read_parsed(&lookup, "REBOUND_MODE", defaults.mode),
            retain_succeeded: match lookup("REBOUND_RETAIN_SUCCEEDED") {
                Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                    warn!(key = "REBOUND_RETAIN_SUCCEEDED", value = %raw, "invalid setting; using default");
                    defaults.retain_succeeded
                }),
                None => defaults.retain_succeeded,
            },
        }
    }

    /// Policy applied when a processor is registered without its own.
    pub fn default_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_multiplier(self.multiplier)
        .with_jitter(self.jitter_fraction)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_mode(self.mode)
            .with_retain_succeeded(self.retain_succeeded)
            .with_attempt_lease(Duration::from_millis(self.claim_lease_ms))
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            // A zero interval would spin and a zero batch would never claim.
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            batch_size: self.sweep_batch_size.max(1),
            claim_lease: Duration::from_millis(self.claim_lease_ms),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

fn read_parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(key, value = %raw, "invalid setting; using default");
        default
    })
}

/// Counts and intervals where zero would stall the service.
fn read_positive<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => value,
        Ok(_) => {
            warn!(key, value = %raw, "setting must be greater than zero; using default");
            default
        }
        Err(_) => {
            warn!(key, value = %raw, "invalid setting; using default");
            default
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "blocking" => Ok(Self::Blocking),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> RetryConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RetryConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn missing_variables_keep_defaults() {
        assert_eq!(config(&[]), RetryConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = config(&[
            ("REBOUND_MAX_ATTEMPTS", "3"),
            ("REBOUND_BASE_DELAY_MS", "250"),
            ("REBOUND_MULTIPLIER", "3.0"),
            ("REBOUND_MODE", "Blocking"),
            ("REBOUND_RETAIN_SUCCEEDED", "yes"),
            ("REBOUND_SWEEP_BATCH_SIZE", "10"),
        ]);

        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.base_delay_ms, 250);
        assert_eq!(cfg.multiplier, 3.0);
        assert_eq!(cfg.mode, ExecutionMode::Blocking);
        assert!(cfg.retain_succeeded);
        assert_eq!(cfg.reconciler_config().batch_size, 10);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("REBOUND_MAX_ATTEMPTS", "many"),
            ("REBOUND_MODE", "eventually"),
            ("REBOUND_RETAIN_SUCCEEDED", "maybe"),
        ]);

        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.mode, ExecutionMode::Deferred);
        assert!(!cfg.retain_succeeded);
    }

    #[test]
    fn zero_counts_and_intervals_fall_back() {
        let cfg = config(&[
            ("REBOUND_SWEEP_BATCH_SIZE", "0"),
            ("REBOUND_SWEEP_INTERVAL_MS", "0"),
            ("REBOUND_CLAIM_LEASE_MS", "0"),
            ("REBOUND_MAX_ATTEMPTS", "0"),
        ]);

        assert_eq!(cfg.sweep_batch_size, 100);
        assert_eq!(cfg.sweep_interval_ms, 5_000);
        assert_eq!(cfg.claim_lease_ms, 60_000);
        assert_eq!(cfg.max_attempts, 5);

        // Zeros set directly are clamped rather than passed through.
        let reconciler = RetryConfig {
            sweep_batch_size: 0,
            sweep_interval_ms: 0,
            ..RetryConfig::default()
        }
        .reconciler_config();
        assert_eq!(reconciler.batch_size, 1);
        assert_eq!(reconciler.sweep_interval, Duration::from_millis(1));
    }

    #[test]
    fn derived_settings() {
        let cfg = RetryConfig::default();

        let policy = cfg.default_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(policy.validate().is_ok());

        assert_eq!(cfg.reconciler_config().sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.orchestrator_config().mode, ExecutionMode::Deferred);
        assert_eq!(cfg.orchestrator_config().attempt_lease, Duration::from_secs(60));
        assert_eq!(cfg.retention(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 2, "mode": "blocking"}"#).unwrap();

        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.mode, ExecutionMode::Blocking);
        assert_eq!(cfg.claim_lease_ms, 60_000);
    }
}
