//! Error types for procedures, the handler and the caller side.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use portlink_protocol::{ErrorCode, ErrorShape, RequestId, ResultKind, TransformError};
use thiserror::Error;

use crate::channel::ChannelError;

/// Failure raised by a procedure, or produced while dispatching to one.
///
/// Every failure on the callee side is normalised into this type before it
/// is reported and written back as an error frame.
#[derive(Clone, Error)]
#[error("{code}: {message}")]
pub struct ProcedureError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl fmt::Debug for ProcedureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl PartialEq for ProcedureError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl ProcedureError {
    /// Creates an error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Creates a `BAD_REQUEST` error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Creates a `NOT_FOUND` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an `INTERNAL_SERVER_ERROR` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Converts a panic payload caught while running a procedure.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Self::internal(format!("procedure panicked: {detail}"))
    }

    /// Returns the symbolic code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the message sent to the caller.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Builds the wire shape for a failure at `path`.
    #[must_use]
    pub fn shape(&self, path: Option<&str>) -> ErrorShape {
        ErrorShape::new(self.code, self.message.clone(), path.map(str::to_owned))
    }
}

/// Protocol-level failures detected by the handler before or after a
/// procedure runs.
#[derive(Debug, Error)]
pub(crate) enum HandlerError {
    #[error("missing params")]
    MissingParams,
    #[error("malformed request frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("duplicate id")]
    DuplicateId,
    #[error("failed to decode input: {0}")]
    Input(#[source] TransformError),
    #[error("failed to encode output: {0}")]
    Output(#[source] TransformError),
    #[error("failed to serialise output: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl From<HandlerError> for ProcedureError {
    fn from(error: HandlerError) -> Self {
        let code = match &error {
            HandlerError::MalformedFrame(_) => ErrorCode::ParseError,
            HandlerError::MissingParams | HandlerError::DuplicateId | HandlerError::Input(_) => {
                ErrorCode::BadRequest
            }
            HandlerError::Output(_) | HandlerError::Serialize(_) => {
                ErrorCode::InternalServerError
            }
        };
        Self::new(code, error.to_string()).with_cause(error)
    }
}

/// Failure delivered to a caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The channel closed before the call finished.
    #[error("port disconnected prematurely")]
    Disconnected,
    /// The callee answered with an error frame.
    #[error("{}", .shape.message)]
    Remote {
        /// Decoded error shape.
        shape: ErrorShape,
    },
    /// The transformer rejected an input or a result.
    #[error("payload transform failed: {0}")]
    Transform(#[from] TransformError),
    /// Posting the request failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Another pending call already uses the id.
    #[error("id {id} is already used by a pending call")]
    DuplicateId {
        /// Conflicting id.
        id: RequestId,
    },
    /// A result or error frame could not be decoded.
    #[error("failed to decode response for '{path}': {message}")]
    Decode {
        /// Procedure path.
        path: String,
        /// Decoder message.
        message: String,
    },
    /// The call input could not be encoded.
    #[error("failed to encode input for '{path}': {message}")]
    Encode {
        /// Procedure path.
        path: String,
        /// Encoder message.
        message: String,
    },
    /// A blocking call did not finish in time.
    #[error("call to '{path}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Procedure path.
        path: String,
        /// Configured timeout.
        timeout_ms: u64,
    },
    /// A blocking call received a lifecycle marker instead of data.
    #[error("call to '{path}' received an unexpected '{kind}' result")]
    UnexpectedResult {
        /// Procedure path.
        path: String,
        /// Marker received.
        kind: ResultKind,
    },
}

impl ClientError {
    /// Returns the symbolic code of a remote error, or the code that best
    /// describes a local failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Remote { shape } => shape.error_code(),
            Self::Disconnected => ErrorCode::ClientClosedRequest,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::DuplicateId { .. } | Self::Encode { .. } => ErrorCode::BadRequest,
            Self::Decode { .. } | Self::UnexpectedResult { .. } => ErrorCode::ParseError,
            Self::Transform(_) | Self::Channel(_) => ErrorCode::InternalServerError,
        }
    }
}
