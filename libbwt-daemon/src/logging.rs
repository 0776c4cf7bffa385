use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Default filter for a `verbose` level when `RUST_LOG` is unset.
pub fn default_filter(verbose: usize) -> &'static str {
    match verbose {
        0 => "warn,libbwt_daemon=info,bwt_daemon=info",
        1 => "info,libbwt_daemon=debug,bwt_daemon=debug",
        2 => "debug,libbwt_daemon=trace,bwt_daemon=trace",
        _ => "trace",
    }
}

/// Install the global fmt subscriber. Only the first call in a process has
/// any effect; the verbosity cannot change afterwards.
pub fn init_logging(verbose: usize) {
    use tracing_subscriber::{fmt, EnvFilter};

    INIT_LOGGER.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(verbose > 1)
            .try_init();
    });
}
