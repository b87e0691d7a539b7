//! Logging initialization for host processes.
//!
//! The library itself only emits through `log` and `tracing`; hosts
//! call `init()` once at startup. The fmt subscriber bridges `log`
//! records, so both families end up in the same output.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber, defaulting to `info` when
/// `RUST_LOG` is unset. Panics if a subscriber is already installed;
/// use [`try_init`] when that is not acceptable.
pub fn init() {
    try_init().expect("failed to install tracing subscriber");
}

/// Fallible variant of [`init`]; errors if a global subscriber is
/// already set (e.g. in tests).
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()?;
    Ok(())
}
