//! Process-wide tracing setup shared by binaries and tests.

/// Initialize process-wide tracing with an `info` default filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
