use crate::logging::LogFormat;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default time a blocking client call waits for its result.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default upper bound on a single JSON line read from a stream port.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value, used as the loader default.
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default blocking call timeout in milliseconds.
#[must_use]
pub const fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

/// Default maximum frame size in bytes.
#[must_use]
pub const fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
