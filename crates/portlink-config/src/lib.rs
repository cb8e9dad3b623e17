//! Shared configuration for portlink processes.
//!
//! [`Config`] derives [`OrthoConfig`], so values resolve from built-in
//! defaults, then a TOML file named by `--config-path` or
//! `PORTLINK_CONFIG_PATH`, then `PORTLINK_*` environment variables, then
//! command-line flags. Later layers override earlier ones field by field.

mod defaults;
mod logging;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_MAX_FRAME_BYTES,
    default_call_timeout_ms, default_log_filter, default_log_filter_string, default_log_format,
    default_max_frame_bytes,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Command-line flags consumed by the configuration loader.
///
/// Each takes one value, given either inline (`--flag=value`) or as the
/// next argument.
pub const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--call-timeout-ms",
    "--max-frame-bytes",
];

/// Runtime configuration shared by the link, the handler and the demo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "PORTLINK")]
pub struct Config {
    /// Tracing filter expression, in `EnvFilter` syntax.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Time a blocking client call waits for its result.
    #[ortho_config(default = default_call_timeout_ms())]
    pub call_timeout_ms: u64,
    /// Upper bound on a single JSON line read from a stream port.
    #[ortho_config(default = default_max_frame_bytes())]
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            call_timeout_ms: default_call_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Config {
    /// Returns the tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Returns the log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Returns the blocking call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Returns the maximum accepted frame size in bytes.
    #[must_use]
    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}
