use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global tracing subscriber. The filter comes from `RUST_LOG`
/// and falls back to `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // A second call (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
