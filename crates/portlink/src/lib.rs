//! Typed procedure calls across an isolated process boundary.
//!
//! portlink carries queries, mutations and long-lived subscriptions over a
//! single ordered duplex [`Channel`] per connection. The caller side wraps a
//! channel in a [`Link`], which multiplexes any number of concurrent calls by
//! correlation id and fails all of them when the channel closes. The callee
//! side attaches a [`Handler`] to a [`ChannelSource`]; every accepted channel
//! gets its own connection state, and each request is resolved against a
//! [`Router`] of named procedures.
//!
//! ```
//! use portlink::{Client, Handler, HandlerOptions, Link, PortHub, ProcedureError, Router};
//! use portlink_config::Config;
//!
//! let router = Router::new().query("echo", |_ctx: &(), text: String| {
//!     Ok::<_, ProcedureError>(text)
//! });
//! let hub = PortHub::new();
//! Handler::new(HandlerOptions::new(router, |_| Ok(()))).attach(&hub);
//!
//! let client = Client::new(Link::new(hub.connect("popup", None)), &Config::default());
//! let echoed: String = client.query("echo", "hi").expect("echo answers");
//! assert_eq!(echoed, "hi");
//! ```
//!
//! ## Streams
//!
//! A subscription procedure returns an [`Observable`]. The handler writes a
//! `started` frame once the stream is subscribed, then one `data` frame per
//! value, and finally `stopped` or `error`. A caller that unsubscribes posts
//! `subscription.stop`; the handler answers with `stopped` and tears the
//! producer down.

pub mod channel;
pub mod client;
pub mod error;
pub mod handler;
pub mod link;
pub mod observable;
pub mod router;
mod sync;
pub mod telemetry;

pub use channel::{Channel, ChannelError, ChannelInfo, ChannelSource, Port, PortHub};
pub use client::{Client, SubscriptionCallbacks};
pub use error::{ClientError, ProcedureError};
pub use handler::{ConnectionHandle, ErrorDetails, ErrorReporter, Handler, HandlerOptions};
pub use link::{CallHandle, CallResult, Link, Operation};
pub use observable::{Observable, Observer, Subscription};
pub use router::{ProcedureCall, ProcedureOutput, Router};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests;
