//! Request and response frames.
//!
//! Frames are wrapped in an [`Envelope`] before they are posted, producing
//! the `{"trpc": {...}}` shape seen on the wire. [`decode`] performs the
//! inverse and classifies each inbound message as foreign traffic, a
//! malformed protocol frame, or a well-formed frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::id::RequestId;

/// Key under which every protocol frame is nested.
pub const ENVELOPE_KEY: &str = "trpc";

/// Call kinds a caller may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallKind {
    /// Read-only call answered by a single frame.
    Query,
    /// State-changing call answered by a single frame.
    Mutation,
    /// Long-lived call answered by `started`, `data`* and `stopped`.
    Subscription,
}

impl CallKind {
    /// Returns the request method used to issue this kind of call.
    #[must_use]
    pub const fn method(self) -> Method {
        match self {
            Self::Query => Method::Query,
            Self::Mutation => Method::Mutation,
            Self::Subscription => Method::Subscription,
        }
    }
}

/// Request methods carried in the `method` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Method {
    /// Issues a query.
    #[serde(rename = "query")]
    #[strum(serialize = "query")]
    Query,
    /// Issues a mutation.
    #[serde(rename = "mutation")]
    #[strum(serialize = "mutation")]
    Mutation,
    /// Opens a subscription.
    #[serde(rename = "subscription")]
    #[strum(serialize = "subscription")]
    Subscription,
    /// Stops the subscription registered under the frame id.
    #[serde(rename = "subscription.stop")]
    #[strum(serialize = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// Returns the call kind for call-issuing methods, `None` for
    /// `subscription.stop`.
    #[must_use]
    pub const fn call_kind(self) -> Option<CallKind> {
        match self {
            Self::Query => Some(CallKind::Query),
            Self::Mutation => Some(CallKind::Mutation),
            Self::Subscription => Some(CallKind::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

/// Procedure address and payload of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Dot-delimited procedure path, for example `greeting.echo`.
    pub path: String,
    /// Transformer-serialized input; absent when the call takes none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Frame sent by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id.
    pub id: RequestId,
    /// Reserved for JSON-RPC compatibility; never set by this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Request method.
    pub method: Method,
    /// Call parameters; absent only for `subscription.stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl RequestFrame {
    /// Builds a call frame for the given kind, path and serialized input.
    #[must_use]
    pub fn call(id: RequestId, kind: CallKind, path: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            id,
            jsonrpc: None,
            method: kind.method(),
            params: Some(RequestParams {
                path: path.into(),
                input,
            }),
        }
    }

    /// Builds a `subscription.stop` frame.
    #[must_use]
    pub const fn stop(id: RequestId) -> Self {
        Self {
            id,
            jsonrpc: None,
            method: Method::SubscriptionStop,
            params: None,
        }
    }
}

/// Lifecycle marker carried in `result.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultKind {
    /// A value produced by the procedure.
    Data,
    /// The stream has been subscribed on the callee side.
    Started,
    /// The stream has ended or was stopped.
    Stopped,
}

/// Successful result body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Lifecycle marker; absence is read as [`ResultKind::Data`].
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResultKind>,
    /// Transformer-serialized value for `data` results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResultPayload {
    /// Returns the lifecycle marker, defaulting to `data` when absent.
    #[must_use]
    pub fn effective_kind(&self) -> ResultKind {
        self.kind.unwrap_or(ResultKind::Data)
    }
}

/// Either a result or an error; never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    /// Successful result.
    Result(ResultPayload),
    /// Transformer-serialized [`ErrorShape`](crate::ErrorShape).
    Error(Value),
}

/// Frame sent by the callee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Correlation id copied from the request.
    pub id: RequestId,
    /// Reserved for JSON-RPC compatibility; never set by this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Result or error.
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseFrame {
    const fn result(id: RequestId, kind: ResultKind, data: Option<Value>) -> Self {
        Self {
            id,
            jsonrpc: None,
            body: ResponseBody::Result(ResultPayload {
                kind: Some(kind),
                data,
            }),
        }
    }

    /// Builds a `data` frame.
    #[must_use]
    pub const fn data(id: RequestId, data: Value) -> Self {
        Self::result(id, ResultKind::Data, Some(data))
    }

    /// Builds a `started` frame.
    #[must_use]
    pub const fn started(id: RequestId) -> Self {
        Self::result(id, ResultKind::Started, None)
    }

    /// Builds a `stopped` frame.
    #[must_use]
    pub const fn stopped(id: RequestId) -> Self {
        Self::result(id, ResultKind::Stopped, None)
    }

    /// Builds an error frame from an already serialized error shape.
    #[must_use]
    pub const fn error(id: RequestId, error: Value) -> Self {
        Self {
            id,
            jsonrpc: None,
            body: ResponseBody::Error(error),
        }
    }
}

/// Wire envelope placing a frame under the `trpc` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The wrapped frame.
    pub trpc: T,
}

impl<T: Serialize> Envelope<T> {
    /// Wraps a frame.
    pub const fn new(frame: T) -> Self {
        Self { trpc: frame }
    }

    /// Serializes the envelope into the JSON value posted on the port.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if the frame cannot be
    /// represented as JSON.
    pub fn into_message(self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Classification of an inbound message.
#[derive(Debug)]
pub enum Incoming<T> {
    /// Not protocol traffic: no `trpc` key, or a null or missing id.
    Ignored,
    /// Protocol traffic that does not match the expected frame shape.
    Malformed {
        /// The id, when it could still be read.
        id: Option<RequestId>,
        /// Why the frame was rejected.
        error: serde_json::Error,
    },
    /// A well-formed frame.
    Frame(T),
}

/// Classifies and decodes an inbound message.
///
/// # Examples
///
/// ```
/// use portlink_protocol::{Incoming, RequestFrame, decode};
/// use serde_json::json;
///
/// let foreign = json!({"kind": "unrelated"});
/// assert!(matches!(decode::<RequestFrame>(&foreign), Incoming::Ignored));
///
/// let stop = json!({"trpc": {"id": 4, "method": "subscription.stop"}});
/// assert!(matches!(decode::<RequestFrame>(&stop), Incoming::Frame(_)));
/// ```
#[must_use]
pub fn decode<T: DeserializeOwned>(message: &Value) -> Incoming<T> {
    let Some(frame) = message.get(ENVELOPE_KEY).filter(|frame| !frame.is_null()) else {
        return Incoming::Ignored;
    };
    let Some(raw_id) = frame.get("id").filter(|id| !id.is_null()) else {
        return Incoming::Ignored;
    };
    match serde_json::from_value::<T>(frame.clone()) {
        Ok(decoded) => Incoming::Frame(decoded),
        Err(error) => Incoming::Malformed {
            id: serde_json::from_value(raw_id.clone()).ok(),
            error,
        },
    }
}
