use tracing::level_filters::LevelFilter;

/// Install the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default; `--verbose` raises the default to debug.
pub fn install(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
