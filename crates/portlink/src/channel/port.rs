//! Thread-backed [`Channel`] implementation.

use std::io::{BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use serde_json::Value;
use tracing::{debug, warn};

use super::lines::{LineRead, read_line_bounded};
use super::{
    CHANNEL_TARGET, Channel, ChannelError, ChannelInfo, DisconnectListener, ListenerId,
    MessageListener,
};
use crate::sync::lock;

enum PortEvent {
    Message(Value),
    Disconnect,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    message: Vec<(ListenerId, MessageListener)>,
    disconnect: Vec<(ListenerId, DisconnectListener)>,
}

impl Listeners {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId::new(self.next_id)
    }
}

enum Outbound {
    Peer(Mutex<Option<Sender<PortEvent>>>),
    Stream(Mutex<Option<Box<dyn Write + Send>>>),
}

struct PortInner {
    info: ChannelInfo,
    connected: AtomicBool,
    listeners: Mutex<Listeners>,
    inbox: Sender<PortEvent>,
    outbound: Outbound,
}

/// One end of a duplex message channel.
///
/// Every endpoint owns a delivery thread that hands inbound messages to the
/// registered listeners one at a time, in arrival order. Clones share the
/// same endpoint.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::mpsc;
///
/// use portlink::channel::{Channel, Port};
/// use serde_json::json;
///
/// let (left, right) = Port::pair("example", None);
/// let (tx, rx) = mpsc::channel();
/// right.add_message_listener(Arc::new(move |message| {
///     tx.send(message.clone()).ok();
/// }));
/// left.post(json!({"hello": "world"}))?;
/// assert_eq!(rx.recv()?, json!({"hello": "world"}));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// Creates two connected in-process endpoints sharing `name` and
    /// `origin`.
    #[must_use]
    pub fn pair(name: impl Into<String>, origin: Option<String>) -> (Self, Self) {
        let info = ChannelInfo::new(name, origin);
        let (left_inbox, left_events) = mpsc::channel();
        let (right_inbox, right_events) = mpsc::channel();
        let left = Self::start(
            info.clone(),
            left_inbox.clone(),
            left_events,
            Outbound::Peer(Mutex::new(Some(right_inbox.clone()))),
        );
        let right = Self::start(
            info,
            right_inbox,
            right_events,
            Outbound::Peer(Mutex::new(Some(left_inbox))),
        );
        (left, right)
    }

    /// Creates an endpoint exchanging newline-delimited JSON over a byte
    /// stream, for example a child process's stdio.
    ///
    /// Lines longer than `max_frame_bytes` and lines that are not JSON are
    /// skipped with a warning. The port disconnects when `reader` reaches
    /// end of file or fails. Disconnecting locally closes `writer`; the
    /// reader thread exits once the stream ends.
    #[must_use]
    pub fn from_stream<R, W>(
        info: ChannelInfo,
        reader: R,
        writer: W,
        max_frame_bytes: usize,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (inbox, events) = mpsc::channel();
        let name = info.name().to_owned();
        let reader_inbox = inbox.clone();
        let port = Self::start(
            info,
            inbox,
            events,
            Outbound::Stream(Mutex::new(Some(Box::new(writer)))),
        );
        thread::spawn(move || run_reader(reader, &reader_inbox, &name, max_frame_bytes));
        port
    }

    fn start(
        info: ChannelInfo,
        inbox: Sender<PortEvent>,
        events: Receiver<PortEvent>,
        outbound: Outbound,
    ) -> Self {
        let inner = Arc::new(PortInner {
            info,
            connected: AtomicBool::new(true),
            listeners: Mutex::new(Listeners::default()),
            inbox,
            outbound,
        });
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || run_delivery(&events, &weak));
        Self { inner }
    }
}

impl PortInner {
    fn notify_peer_disconnect(&self) {
        if let Outbound::Peer(peer) = &self.outbound
            && let Some(sender) = lock(peer).take()
            && sender.send(PortEvent::Disconnect).is_err()
        {
            debug!(target: CHANNEL_TARGET, port = %self.info, "peer endpoint already gone");
        }
    }

    fn close_outbound(&self) {
        match &self.outbound {
            Outbound::Peer(peer) => drop(lock(peer).take()),
            Outbound::Stream(writer) => drop(lock(writer).take()),
        }
    }

    fn disconnected(&self) -> ChannelError {
        ChannelError::Disconnected {
            name: self.info.name().to_owned(),
        }
    }

    fn write_line(
        &self,
        writer: &Mutex<Option<Box<dyn Write + Send>>>,
        message: &Value,
    ) -> Result<(), ChannelError> {
        let mut bytes = serde_json::to_vec(message).map_err(|source| ChannelError::Encode {
            name: self.info.name().to_owned(),
            source: Arc::new(source),
        })?;
        bytes.push(b'\n');
        let mut guard = lock(writer);
        let stream = guard.as_mut().ok_or_else(|| self.disconnected())?;
        stream
            .write_all(&bytes)
            .and_then(|()| stream.flush())
            .map_err(|source| ChannelError::Io {
                name: self.info.name().to_owned(),
                source: Arc::new(source),
            })
    }
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.notify_peer_disconnect();
        }
    }
}

impl Channel for Port {
    fn info(&self) -> &ChannelInfo {
        &self.inner.info
    }

    fn post(&self, message: Value) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            return Err(inner.disconnected());
        }
        match &inner.outbound {
            Outbound::Peer(peer) => {
                let guard = lock(peer);
                let sender = guard.as_ref().ok_or_else(|| inner.disconnected())?;
                sender
                    .send(PortEvent::Message(message))
                    .map_err(|_| inner.disconnected())
            }
            Outbound::Stream(writer) => {
                let result = inner.write_line(writer, &message);
                if let Err(ChannelError::Io { source, .. }) = &result {
                    warn!(
                        target: CHANNEL_TARGET,
                        port = %inner.info,
                        error = %source,
                        "stream write failed; disconnecting"
                    );
                    self.disconnect();
                }
                result
            }
        }
    }

    fn add_message_listener(&self, listener: MessageListener) -> ListenerId {
        let mut listeners = lock(&self.inner.listeners);
        let id = listeners.allocate();
        listeners.message.push((id, listener));
        id
    }

    fn add_disconnect_listener(&self, listener: DisconnectListener) -> ListenerId {
        let mut listeners = lock(&self.inner.listeners);
        let id = listeners.allocate();
        listeners.disconnect.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut listeners = lock(&self.inner.listeners);
        listeners.message.retain(|(existing, _)| *existing != id);
        listeners.disconnect.retain(|(existing, _)| *existing != id);
    }

    fn disconnect(&self) {
        let inner = &self.inner;
        if !inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(target: CHANNEL_TARGET, port = %inner.info, "disconnecting port");
        inner.notify_peer_disconnect();
        inner.close_outbound();
        if inner.inbox.send(PortEvent::Disconnect).is_err() {
            debug!(target: CHANNEL_TARGET, port = %inner.info, "delivery thread already stopped");
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

fn run_delivery(events: &Receiver<PortEvent>, port: &Weak<PortInner>) {
    while let Ok(event) = events.recv() {
        let Some(inner) = port.upgrade() else {
            return;
        };
        match event {
            PortEvent::Message(message) => {
                if !inner.connected.load(Ordering::SeqCst) {
                    debug!(
                        target: CHANNEL_TARGET,
                        port = %inner.info,
                        "dropping message after disconnect"
                    );
                    continue;
                }
                let listeners: Vec<MessageListener> = lock(&inner.listeners)
                    .message
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in listeners {
                    listener(&message);
                }
            }
            PortEvent::Disconnect => {
                inner.connected.store(false, Ordering::SeqCst);
                inner.close_outbound();
                let listeners = {
                    let mut guard = lock(&inner.listeners);
                    guard.message.clear();
                    std::mem::take(&mut guard.disconnect)
                };
                for (_, listener) in listeners {
                    listener();
                }
                return;
            }
        }
    }
}

fn run_reader<R: Read>(source: R, inbox: &Sender<PortEvent>, name: &str, max_frame_bytes: usize) {
    let mut reader = BufReader::new(source);
    loop {
        match read_line_bounded(&mut reader, max_frame_bytes) {
            Ok(LineRead::Line(bytes)) => {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(message) => {
                        if inbox.send(PortEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(error) => warn!(
                        target: CHANNEL_TARGET,
                        port = name,
                        error = %error,
                        "skipping line that is not JSON"
                    ),
                }
            }
            Ok(LineRead::Oversize(size)) => warn!(
                target: CHANNEL_TARGET,
                port = name,
                size,
                max_size = max_frame_bytes,
                "skipping oversize line"
            ),
            Ok(LineRead::Eof) => break,
            Err(error) => {
                warn!(
                    target: CHANNEL_TARGET,
                    port = name,
                    error = %error,
                    "stream read failed"
                );
                break;
            }
        }
    }
    debug!(target: CHANNEL_TARGET, port = name, "stream ended");
    if inbox.send(PortEvent::Disconnect).is_err() {
        debug!(target: CHANNEL_TARGET, port = name, "delivery thread already stopped");
    }
}
