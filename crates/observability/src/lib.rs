//! Tracing setup shared by binaries and tests.

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Initialize process-wide tracing from `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing with an explicit filter directive such as
/// `"rebound_engine=debug"`.
pub fn init_with_filter(directive: &str) {
    tracing::init_with_filter(directive);
}
