//! Logging setup.
//!
//! Structured logs go to **stderr** through `tracing-subscriber`, so stdout
//! stays parseable for CLI output. The filter is read from `RUST_LOG`
//! (default `info`), e.g. `RUST_LOG=cbam_intake=debug`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber. Call once at process start.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// Subscriber for tests: debug level, captured by the test harness.
/// Safe to call more than once.
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
