//! Bootstrap utilities for the coursepay server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the COURSEPAY_LOG environment variable.
///
/// Defaults to "info" level if COURSEPAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("COURSEPAY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Path of the config file named by the first CLI argument, if any.
pub fn parse_config_path() -> Option<String> {
    std::env::args().nth(1)
}
