use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber, filtered by `RUST_LOG` or `default_filter`.
/// Later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
