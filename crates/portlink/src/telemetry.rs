//! Log output for processes that speak portlink frames.
//!
//! A process serving over its own stdio cannot log to stdout without
//! corrupting the frame stream, so every event here goes to stderr. The
//! subscriber is process-global; [`initialise`] installs it on the first
//! call and only hands out handles afterwards.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use portlink_config::{Config, LogFormat};
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Proof that logging is set up for this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Why logging could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid `EnvFilter` directive list.
    #[error("log filter does not parse: {0}")]
    Filter(String),
    /// Something else already owns the global subscriber.
    #[error("could not register the log subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Sets up stderr logging from `config`.
///
/// Both ends of a bridge usually call this during start-up, and the demo
/// parent and child share one binary, so repeat calls are expected and
/// leave the first subscriber in place.
///
/// # Examples
///
/// ```rust
/// use portlink::telemetry;
/// use portlink_config::{Config, LogFormat};
///
/// # fn main() -> Result<(), portlink::telemetry::TelemetryError> {
/// let config = Config {
///     log_filter: "portlink=debug".to_owned(),
///     log_format: LogFormat::Compact,
///     ..Config::default()
/// };
/// let _logging = telemetry::initialise(&config)?;
/// // A second caller, such as a handler set up later, gets a handle too.
/// let _again = telemetry::initialise(&Config::default())?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable filter and
/// [`TelemetryError::Subscriber`] when another library got there first.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED
        .get_or_try_init(|| install_subscriber(config))
        .map(|()| TelemetryHandle)
}

fn stderr_subscriber(
    config: &Config,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;
    let base = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        // Delivery threads are unnamed; ids tell connections apart.
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(base.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(base.compact().finish()),
    })
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let subscriber = stderr_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
