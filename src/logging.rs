//! Cross-cutting debug logging (component I).
//!
//! The library itself never installs a subscriber or touches process-global state — every
//! adapter logs through `tracing` against whatever subscriber the caller (or a test) installs.
//! This helper is provided for binaries and tests that just want a sane default.

/// Installs a `tracing-subscriber` that reads `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
