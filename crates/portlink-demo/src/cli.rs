//! Command-line arguments for the demo binary.

use std::path::PathBuf;

use clap::Parser;
use portlink_config::LogFormat;

/// Runs procedures in a child process over its stdio.
#[derive(Parser, Debug)]
#[command(name = "portlink-demo", version)]
pub(crate) struct Cli {
    /// Serves the demo router over stdin and stdout instead of spawning a
    /// child.
    #[arg(long)]
    pub(crate) serve: bool,
    /// TOML configuration file applied before environment overrides.
    #[arg(long, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,
    /// Overrides the tracing filter expression.
    #[arg(long, value_name = "FILTER")]
    pub(crate) log_filter: Option<String>,
    /// Overrides the log output format.
    #[arg(long, value_name = "FORMAT")]
    pub(crate) log_format: Option<LogFormat>,
    /// Overrides how long a call waits for its result, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub(crate) call_timeout_ms: Option<u64>,
    /// Overrides the largest frame accepted from a stream, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub(crate) max_frame_bytes: Option<usize>,
    /// Message sent to `greeting.echo`.
    #[arg(long, default_value = "hello from the parent")]
    pub(crate) message: String,
    /// Number of `clock.ticks` values read before unsubscribing.
    #[arg(long, default_value_t = 3)]
    pub(crate) ticks: u64,
    /// Interval between ticks in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub(crate) tick_interval_ms: u64,
}

impl Cli {
    /// Returns the flags a spawned child needs to share this process's
    /// configuration.
    pub(crate) fn child_arguments(&self) -> Vec<String> {
        let mut arguments = vec!["--serve".to_owned()];
        if let Some(path) = &self.config_path {
            arguments.push("--config-path".to_owned());
            arguments.push(path.display().to_string());
        }
        if let Some(filter) = &self.log_filter {
            arguments.push("--log-filter".to_owned());
            arguments.push(filter.clone());
        }
        if let Some(format) = self.log_format {
            arguments.push("--log-format".to_owned());
            arguments.push(format.to_string());
        }
        if let Some(timeout) = self.call_timeout_ms {
            arguments.push("--call-timeout-ms".to_owned());
            arguments.push(timeout.to_string());
        }
        if let Some(bytes) = self.max_frame_bytes {
            arguments.push("--max-frame-bytes".to_owned());
            arguments.push(bytes.to_string());
        }
        arguments
    }
}
