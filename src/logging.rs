use tracing_subscriber::EnvFilter;

/// Installs the diagnostic subscriber. `RUST_LOG` overrides the default level.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Notifications for the worker go to stdout; diagnostics stay on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    tracing::debug!("logging initialized");
}
