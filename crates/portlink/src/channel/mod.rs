//! Duplex message channels.
//!
//! A [`Channel`] is one end of an ordered, bidirectional message pipe
//! carrying JSON values. The link and the handler only ever talk to this
//! trait; [`Port`] provides in-process and byte-stream implementations and
//! [`PortHub`] hands freshly connected ports to whoever listens for them.

mod hub;
mod lines;
mod port;

use std::fmt;
use std::io;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use self::hub::PortHub;
pub use self::port::Port;

const CHANNEL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::channel");

/// Callback invoked for each inbound message.
pub type MessageListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback invoked once when the channel disconnects.
pub type DisconnectListener = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked with each newly connected channel.
pub type ConnectListener<C> = Arc<dyn Fn(C) + Send + Sync>;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Descriptive details of a channel, used by handler policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    name: String,
    origin: Option<String>,
}

impl ChannelInfo {
    /// Creates channel details.
    #[must_use]
    pub fn new(name: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            name: name.into(),
            origin,
        }
    }

    /// Returns the channel name chosen by the connecting side.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the origin of the connecting side, when known.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{} ({origin})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Errors raised when posting to a channel.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel has been disconnected by either end.
    #[error("port '{name}' is disconnected")]
    Disconnected {
        /// Channel name.
        name: String,
    },
    /// The message could not be encoded for a byte stream.
    #[error("failed to encode message for port '{name}': {source}")]
    Encode {
        /// Channel name.
        name: String,
        /// Underlying encoding error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// Writing to the underlying stream failed.
    #[error("I/O error on port '{name}': {source}")]
    Io {
        /// Channel name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// One end of an ordered duplex message channel.
///
/// Implementations deliver inbound messages to every message listener in
/// arrival order, and notify every disconnect listener once, after the last
/// message, when either end disconnects.
pub trait Channel: Send + Sync + 'static {
    /// Returns the channel details.
    fn info(&self) -> &ChannelInfo;

    /// Sends a message to the other end.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel is disconnected or the
    /// message cannot be written.
    fn post(&self, message: Value) -> Result<(), ChannelError>;

    /// Registers a listener for inbound messages.
    fn add_message_listener(&self, listener: MessageListener) -> ListenerId;

    /// Registers a listener for disconnection.
    fn add_disconnect_listener(&self, listener: DisconnectListener) -> ListenerId;

    /// Removes a previously registered listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);

    /// Disconnects the channel. Repeated calls have no further effect.
    fn disconnect(&self);

    /// Returns `true` until either end disconnects.
    fn is_connected(&self) -> bool;
}

/// Source of newly connected channels, the callee's accept point.
pub trait ChannelSource {
    /// Channel type produced by this source.
    type Channel: Channel;

    /// Registers a listener invoked with every channel that connects after
    /// the call.
    fn on_connect(&self, listener: ConnectListener<Self::Channel>);
}
