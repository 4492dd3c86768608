//! Tracing/logging initialization.
//!
//! JSON lines with timestamps; the retry engine logs structured fields
//! (`event_id`, `attempt`, `error`) that survive the JSON encoding as-is.

use tracing_subscriber::EnvFilter;

/// Initialize tracing, honouring `RUST_LOG` when set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

/// Initialize tracing with a fixed filter; an invalid directive falls back
/// to `info`.
pub fn init_with_filter(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

fn install(filter: EnvFilter) {
    // A global subscriber may already be set (tests, embedding binaries).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_initialization_is_harmless() {
        super::init_with_filter("debug");
        super::init();
        super::init_with_filter("not a [valid directive");
        tracing::info!(attempt = 1, "still logging");
    }
}
