//! In-process accept point for [`Port`] connections.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::{CHANNEL_TARGET, Channel, ChannelSource, ConnectListener, Port};
use crate::sync::lock;

/// Connects callers to whoever listens for new ports.
///
/// Each [`PortHub::connect`] creates a fresh [`Port::pair`], keeps one end
/// for the caller and hands the other end to every connect listener.
#[derive(Clone, Default)]
pub struct PortHub {
    listeners: Arc<Mutex<Vec<ConnectListener<Port>>>>,
}

impl PortHub {
    /// Creates a hub with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection and returns the caller's end.
    ///
    /// When nobody listens, the remote end is disconnected at once so the
    /// caller observes a closed port instead of waiting forever.
    #[must_use]
    pub fn connect(&self, name: impl Into<String>, origin: Option<String>) -> Port {
        let (local, remote) = Port::pair(name, origin);
        let listeners = lock(&self.listeners).clone();
        if listeners.is_empty() {
            warn!(
                target: CHANNEL_TARGET,
                port = %remote.info(),
                "no connect listeners registered; closing port"
            );
            remote.disconnect();
            return local;
        }
        debug!(
            target: CHANNEL_TARGET,
            port = %remote.info(),
            listeners = listeners.len(),
            "port connected"
        );
        for listener in listeners {
            listener(remote.clone());
        }
        local
    }
}

impl ChannelSource for PortHub {
    type Channel = Port;

    fn on_connect(&self, listener: ConnectListener<Port>) {
        lock(&self.listeners).push(listener);
    }
}
