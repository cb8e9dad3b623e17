//! Error shape carried by `error` response frames.
//!
//! The shape mirrors a JSON-RPC error object: a numeric `code`, a
//! human-readable `message`, and a `data` object repeating the symbolic code
//! together with its HTTP status and the procedure path that failed.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Symbolic error codes understood by both ends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The frame could not be parsed.
    ParseError,
    /// The request was structurally invalid or its input was rejected.
    BadRequest,
    /// The procedure failed unexpectedly.
    InternalServerError,
    /// The procedure exists but is not implemented.
    NotImplemented,
    /// The caller is not authenticated.
    Unauthorized,
    /// The caller may not perform the call.
    Forbidden,
    /// No procedure exists at the requested path.
    NotFound,
    /// The procedure does not accept the requested method.
    MethodNotSupported,
    /// The call took too long.
    Timeout,
    /// The call conflicts with current state.
    Conflict,
    /// A precondition of the call does not hold.
    PreconditionFailed,
    /// The request payload exceeds a limit.
    PayloadTooLarge,
    /// The input was well formed but semantically invalid.
    UnprocessableContent,
    /// The caller is being rate limited.
    TooManyRequests,
    /// The caller went away before the call finished.
    ClientClosedRequest,
}

impl ErrorCode {
    /// Returns the JSON-RPC numeric code placed in [`ErrorShape::code`].
    #[must_use]
    pub const fn json_rpc_code(self) -> i32 {
        match self {
            Self::ParseError => -32_700,
            Self::BadRequest => -32_600,
            Self::InternalServerError | Self::NotImplemented => -32_603,
            Self::Unauthorized => -32_001,
            Self::Forbidden => -32_003,
            Self::NotFound => -32_004,
            Self::MethodNotSupported => -32_005,
            Self::Timeout => -32_008,
            Self::Conflict => -32_009,
            Self::PreconditionFailed => -32_012,
            Self::PayloadTooLarge => -32_013,
            Self::UnprocessableContent => -32_022,
            Self::TooManyRequests => -32_029,
            Self::ClientClosedRequest => -32_099,
        }
    }

    /// Returns the HTTP status reported in [`ErrorData::http_status`].
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::ParseError | Self::BadRequest => 400,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotSupported => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::UnprocessableContent => 422,
            Self::TooManyRequests => 429,
            Self::ClientClosedRequest => 499,
        }
    }
}

/// Structured details nested under [`ErrorShape::data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Symbolic error code.
    pub code: ErrorCode,
    /// HTTP status matching [`ErrorData::code`].
    #[serde(rename = "httpStatus")]
    pub http_status: u16,
    /// Procedure path, when the failure is tied to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Error object sent in `error` response frames.
///
/// # Examples
///
/// ```
/// use portlink_protocol::{ErrorCode, ErrorShape};
///
/// let shape = ErrorShape::new(ErrorCode::NotFound, "no such procedure", Some("a.b".into()));
/// assert_eq!(shape.code, -32004);
/// assert_eq!(shape.data.http_status, 404);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Human-readable message.
    pub message: String,
    /// JSON-RPC numeric code.
    pub code: i32,
    /// Symbolic code, HTTP status and path.
    pub data: ErrorData,
}

impl ErrorShape {
    /// Builds a shape whose numeric code and HTTP status follow `code`.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, path: Option<String>) -> Self {
        Self {
            message: message.into(),
            code: code.json_rpc_code(),
            data: ErrorData {
                code,
                http_status: code.http_status(),
                path,
            },
        }
    }

    /// Returns the symbolic code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        self.data.code
    }
}
