//! Bootstrap utilities for docrelay binaries and embedding hosts.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the DOCRELAY_LOG environment variable.
///
/// Defaults to "info" level if DOCRELAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config path from the first `--config <path>` / `-c <path>` argument.
pub fn parse_config_path(args: &[String]) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == "--config" || w[0] == "-c")
        .map(|w| w[1].clone())
}
