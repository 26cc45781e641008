//! Structured logging for the `hotswap` binary.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter directives.
pub const LOG_ENV_VAR: &str = "HOTSWAP_LOG";

/// Builds the filter from [`LOG_ENV_VAR`], falling back to `verbosity`.
#[must_use]
pub fn filter(verbosity: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(verbosity.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy()
}

/// Installs the global subscriber writing human-readable events to stderr.
///
/// # Errors
///
/// Returns [`TryInitError`] when a global subscriber is already installed.
pub fn init(verbosity: LevelFilter) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(verbosity))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
}
