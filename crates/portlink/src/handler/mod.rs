//! Callee-side dispatcher.
//!
//! A [`Handler`] serves a [`Router`] over every channel it is attached to.
//! Each accepted channel gets its own connection state: the subscriptions it
//! has opened and the cleanup that runs when it closes. Channels share
//! nothing but the router and the handler options.

mod cleanup;
mod connection;
mod registry;

use std::fmt;
use std::sync::Arc;

use portlink_protocol::{CallKind, IdentityTransformer, Transformer};
use serde_json::Value;
use tracing::{debug, info};

use self::connection::Connection;
use crate::channel::{Channel, ChannelInfo, ChannelSource};
use crate::error::ProcedureError;
use crate::router::Router;

const HANDLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handler");

/// Builds the per-call context from the channel the call arrived on.
pub type ContextFactory<Ctx> =
    Arc<dyn Fn(&ChannelInfo) -> Result<Ctx, ProcedureError> + Send + Sync>;

/// Decides whether a newly connected channel is served.
pub type ChannelFilter = Arc<dyn Fn(&ChannelInfo) -> bool + Send + Sync>;

/// Everything known about a failed call.
#[derive(Debug, Clone)]
pub struct ErrorDetails {
    /// Procedure path, when the frame carried one.
    pub path: Option<String>,
    /// Call kind, when the frame named one.
    pub kind: Option<CallKind>,
    /// Input after the transformer ran.
    pub input: Option<Value>,
    /// The normalised failure.
    pub error: ProcedureError,
    /// Channel the call arrived on.
    pub channel: ChannelInfo,
}

/// Receives every failure the handler turns into an error frame.
pub trait ErrorReporter: Send + Sync {
    /// Called once per failed call.
    fn report(&self, details: &ErrorDetails);
}

/// Configuration of a [`Handler`].
pub struct HandlerOptions<Ctx> {
    router: Router<Ctx>,
    create_context: ContextFactory<Ctx>,
    on_error: Option<Arc<dyn ErrorReporter>>,
    accept_channel: Option<ChannelFilter>,
    transformer: Arc<dyn Transformer>,
}

impl<Ctx: 'static> HandlerOptions<Ctx> {
    /// Serves `router`, building each call's context with `create_context`.
    #[must_use]
    pub fn new<F>(router: Router<Ctx>, create_context: F) -> Self
    where
        F: Fn(&ChannelInfo) -> Result<Ctx, ProcedureError> + Send + Sync + 'static,
    {
        Self {
            router,
            create_context: Arc::new(create_context),
            on_error: None,
            accept_channel: None,
            transformer: Arc::new(IdentityTransformer),
        }
    }

    /// Reports every failed call to `reporter`.
    #[must_use]
    pub fn on_error(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.on_error = Some(Arc::new(reporter));
        self
    }

    /// Serves only channels for which `filter` returns `true`.
    #[must_use]
    pub fn accept_channel<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ChannelInfo) -> bool + Send + Sync + 'static,
    {
        self.accept_channel = Some(Arc::new(filter));
        self
    }

    /// Uses `transformer` for inputs, results and errors.
    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }
}

/// Serves a router over any number of channels.
pub struct Handler<Ctx> {
    options: Arc<HandlerOptions<Ctx>>,
}

impl<Ctx> Clone for Handler<Ctx> {
    fn clone(&self) -> Self {
        Self {
            options: Arc::clone(&self.options),
        }
    }
}

impl<Ctx: 'static> Handler<Ctx> {
    /// Creates a handler from its options.
    #[must_use]
    pub fn new(options: HandlerOptions<Ctx>) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    /// Serves every channel `source` connects from now on.
    pub fn attach<S: ChannelSource>(&self, source: &S) {
        let handler = self.clone();
        source.on_connect(Arc::new(move |channel| {
            match handler.attach_channel(channel) {
                Some(connection) => {
                    debug!(target: HANDLER_TARGET, port = %connection.info(), "connection attached");
                }
                None => debug!(target: HANDLER_TARGET, "connection refused"),
            }
        }));
    }

    /// Serves a single, already connected channel.
    ///
    /// Returns `None` when the channel filter refuses it, in which case the
    /// channel is disconnected and left without listeners.
    #[must_use]
    pub fn attach_channel<C: Channel>(&self, channel: C) -> Option<ConnectionHandle> {
        if let Some(filter) = &self.options.accept_channel
            && !filter(channel.info())
        {
            info!(target: HANDLER_TARGET, port = %channel.info(), "channel refused by filter");
            channel.disconnect();
            return None;
        }
        let connection = Connection::open(channel, Arc::clone(&self.options));
        Some(ConnectionHandle { connection })
    }
}

/// Operations a [`ConnectionHandle`] exposes, independent of the channel
/// and context types.
trait ConnectionControl: Send + Sync {
    fn info(&self) -> &ChannelInfo;
    fn active_subscriptions(&self) -> usize;
    fn is_closed(&self) -> bool;
    fn shutdown(&self);
}

/// Handle to one served channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<dyn ConnectionControl>,
}

impl ConnectionHandle {
    /// Returns the channel details.
    #[must_use]
    pub fn info(&self) -> &ChannelInfo {
        self.connection.info()
    }

    /// Returns the number of subscriptions currently streaming.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.connection.active_subscriptions()
    }

    /// Returns `true` once the connection's cleanup has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Disconnects the channel and stops every active subscription.
    pub fn close(&self) {
        self.connection.shutdown();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("info", self.info())
            .field("active_subscriptions", &self.active_subscriptions())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
