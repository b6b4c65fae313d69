use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_level`.
/// Repeated calls are ignored.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
