//! Wire types shared by both legs of a portlink connection.
//!
//! Every message exchanged over a port is a JSON object with a single `trpc`
//! key. Requests travel from the caller-side link to the callee-side handler;
//! responses travel back carrying the same correlation id:
//!
//! ```json
//! {"trpc":{"id":1,"method":"query","params":{"path":"greeting.echo","input":{"payload":"x"}}}}
//! {"trpc":{"id":1,"result":{"type":"data","data":{"payload":"x"}}}}
//! ```
//!
//! Messages without a `trpc` key, or whose `trpc.id` is null or absent, do
//! not belong to the protocol and are ignored by both ends so a port can be
//! shared with unrelated traffic.
//!
//! Payloads (`input`, `data` and `error`) pass through a [`Transformer`]
//! before they reach the wire, so both ends must agree on the transformer in
//! use.

pub mod error;
pub mod frame;
mod id;
pub mod transformer;

pub use self::error::{ErrorCode, ErrorData, ErrorShape};
pub use self::frame::{
    CallKind, Envelope, Incoming, Method, RequestFrame, RequestParams, ResponseBody,
    ResponseFrame, ResultKind, ResultPayload, decode,
};
pub use self::id::RequestId;
pub use self::transformer::{
    EnvelopeTransformer, IdentityTransformer, TransformError, Transformer,
};
