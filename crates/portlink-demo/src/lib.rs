//! Runs portlink procedures in a child process over its stdio.
//!
//! Without flags the binary spawns itself with `--serve`, connects a
//! [`portlink::Client`] to the child's stdin and stdout, and prints the
//! results of a few calls. With `--serve` it answers requests on its own
//! stdin and stdout until the parent hangs up. Logs always go to stderr so
//! the frame stream stays clean.

use std::ffi::OsString;
use std::io::{self, Write};
use std::process::{ExitCode, ExitStatus};
use std::sync::Arc;

use clap::Parser;
use portlink::{ClientError, TelemetryError, telemetry};
use thiserror::Error;
use tracing::debug;

mod child;
mod cli;
mod config;
mod parent;
pub mod procedures;

use cli::Cli;
use config::{ConfigLoader, OrthoConfigLoader};

const DEMO_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::run");

/// Failures that end a demo run.
#[derive(Debug, Error)]
pub enum DemoError {
    /// The configuration could not be loaded.
    #[error("failed to load configuration: {0}")]
    Config(Arc<ortho_config::OrthoError>),
    /// Logging could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The child process could not be started.
    #[error("failed to spawn the serving process: {0}")]
    Spawn(io::Error),
    /// The child was spawned without one of its piped streams.
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
    /// Waiting for the child failed.
    #[error("failed to wait for the serving process: {0}")]
    Wait(io::Error),
    /// The child exited unsuccessfully.
    #[error("serving process exited with {0}")]
    ChildFailed(ExitStatus),
    /// The handler refused the stdio channel.
    #[error("the stdio channel was refused")]
    Refused,
    /// A call failed.
    #[error("call failed: {0}")]
    Call(Box<ClientError>),
    /// The tick stream ended before enough ticks arrived.
    #[error("clock stream ended after {received} of {expected} ticks")]
    StreamEnded {
        /// Ticks received.
        received: u64,
        /// Ticks requested.
        expected: u64,
    },
    /// Writing the report failed.
    #[error("failed to write output: {0}")]
    Output(io::Error),
}

impl From<ClientError> for DemoError {
    fn from(error: ClientError) -> Self {
        Self::Call(Box::new(error))
    }
}

/// Runs the demo with `args`, writing the report to `stdout` and failures
/// to `stderr`.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let arguments: Vec<OsString> = args.into_iter().collect();
    let cli = match Cli::try_parse_from(&arguments) {
        Ok(cli) => cli,
        Err(error) => {
            let rendered = error.render();
            let (written, code) = if error.use_stderr() {
                (write!(stderr, "{rendered}"), ExitCode::FAILURE)
            } else {
                (write!(stdout, "{rendered}"), ExitCode::SUCCESS)
            };
            if let Err(write_error) = written {
                debug!(target: DEMO_TARGET, error = %write_error, "failed to print usage");
            }
            return code;
        }
    };

    match execute(&cli, &arguments, &OrthoConfigLoader, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if let Err(write_error) = writeln!(stderr, "{error}") {
                debug!(target: DEMO_TARGET, error = %write_error, "failed to print error");
            }
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(
    cli: &Cli,
    args: &[OsString],
    loader: &dyn ConfigLoader,
    stdout: &mut W,
) -> Result<(), DemoError> {
    let config = loader.load(args)?;
    let _telemetry = telemetry::initialise(&config)?;
    if cli.serve {
        child::serve(&config)
    } else {
        parent::run(cli, &config, stdout)
    }
}

#[cfg(test)]
mod tests {
    use portlink_config::Config;
    use rstest::rstest;

    use super::*;

    struct FailingLoader;

    impl ConfigLoader for FailingLoader {
        fn load(&self, _args: &[OsString]) -> Result<Config, DemoError> {
            Err(DemoError::Refused)
        }
    }

    #[rstest]
    fn load_failure_stops_before_any_work() {
        let args = vec![OsString::from("portlink-demo"), OsString::from("--serve")];
        let cli = Cli::try_parse_from(&args).expect("flags parse");
        let mut stdout = Vec::new();

        let outcome = execute(&cli, &args, &FailingLoader, &mut stdout);

        assert!(matches!(outcome, Err(DemoError::Refused)));
        assert!(stdout.is_empty());
    }

    #[rstest]
    fn bad_configuration_flag_is_reported_on_stderr() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let code = run(
            ["portlink-demo", "--serve", "--call-timeout-ms", "soon"].map(OsString::from),
            &mut stdout,
            &mut stderr,
        );

        assert_eq!(code, ExitCode::FAILURE);
        assert!(stdout.is_empty());
    }

    #[rstest]
    fn usage_errors_go_to_stderr() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let code = run(
            [OsString::from("portlink-demo"), OsString::from("--bogus")],
            &mut stdout,
            &mut stderr,
        );

        assert_eq!(code, ExitCode::FAILURE);
        assert!(stdout.is_empty());
        assert!(String::from_utf8_lossy(&stderr).contains("--bogus"));
    }
}
