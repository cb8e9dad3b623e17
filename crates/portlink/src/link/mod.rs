//! Caller-side multiplexer.
//!
//! A [`Link`] owns one channel and lets any number of calls share it. Each
//! call is registered in a pending-call table under its correlation id
//! before the request frame is posted; response frames are routed back to
//! the matching call and everything else on the channel is ignored. When the
//! channel closes every pending call fails with
//! [`ClientError::Disconnected`].

mod pending;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use portlink_protocol::{
    CallKind, Envelope, ErrorShape, IdentityTransformer, Incoming, RequestFrame, RequestId,
    ResponseBody, ResponseFrame, ResultKind, ResultPayload, Transformer, decode,
};
use serde_json::Value;
use tracing::{debug, warn};

use self::pending::{CallObserver, PendingCall, PendingCalls};
use crate::channel::{Channel, ListenerId};
use crate::error::ClientError;
use crate::observable::{Observer, Sink};
use crate::sync::lock;

const LINK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::link");

/// Event delivered to a call observer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// The callee subscribed the stream.
    Started,
    /// A value, already passed through the transformer.
    Data(Value),
    /// The callee ended the stream.
    Stopped,
}

/// Outgoing call description.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Correlation id; the link allocates one when absent.
    pub id: Option<RequestId>,
    /// Call kind.
    pub kind: CallKind,
    /// Dot-delimited procedure path.
    pub path: String,
    /// Application-level input, serialised by the link's transformer.
    pub input: Option<Value>,
}

impl Operation {
    /// Describes a call with a link-allocated id.
    #[must_use]
    pub fn new(kind: CallKind, path: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            id: None,
            kind,
            path: path.into(),
            input,
        }
    }

    /// Uses a caller-chosen correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

trait CallCanceller: Send + Sync {
    fn cancel(&self, id: &RequestId, key: u64);
}

/// Handle to an issued call.
///
/// [`CallHandle::unsubscribe`] cancels the call if it is still pending.
/// Handles do not keep the link alive.
#[derive(Clone)]
pub struct CallHandle {
    link: Option<Weak<dyn CallCanceller>>,
    id: RequestId,
    key: u64,
}

impl CallHandle {
    const fn detached(id: RequestId) -> Self {
        Self {
            link: None,
            id,
            key: 0,
        }
    }

    /// Returns the call's correlation id.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Cancels the call.
    ///
    /// If the call is still pending its entry is removed, its observer
    /// completes, and for subscriptions a `subscription.stop` frame is
    /// posted. Once this returns no further event reaches the observer.
    /// Calls that already finished are left untouched.
    pub fn unsubscribe(&self) {
        if let Some(link) = self.link.as_ref().and_then(Weak::upgrade) {
            link.cancel(&self.id, self.key);
        }
    }
}

struct LinkInner<C: Channel> {
    channel: C,
    transformer: Arc<dyn Transformer>,
    pending: PendingCalls,
    closed: AtomicBool,
    next_id: AtomicI64,
    listeners: Mutex<Vec<ListenerId>>,
}

/// Caller-side multiplexer over one channel.
pub struct Link<C: Channel> {
    inner: Arc<LinkInner<C>>,
}

impl<C: Channel> Clone for Link<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel> Link<C> {
    /// Creates a link using the identity transformer.
    #[must_use]
    pub fn new(channel: C) -> Self {
        Self::with_transformer(channel, Arc::new(IdentityTransformer))
    }

    /// Creates a link using `transformer` for inputs, results and errors.
    #[must_use]
    pub fn with_transformer(channel: C, transformer: Arc<dyn Transformer>) -> Self {
        let inner = Arc::new(LinkInner {
            channel,
            transformer,
            pending: PendingCalls::default(),
            closed: AtomicBool::new(false),
            next_id: AtomicI64::new(1),
            listeners: Mutex::new(Vec::new()),
        });

        let on_message = Arc::downgrade(&inner);
        let message_listener = inner.channel.add_message_listener(Arc::new(move |message| {
            if let Some(link) = on_message.upgrade() {
                link.route(message);
            }
        }));
        let on_disconnect = Arc::downgrade(&inner);
        let disconnect_listener = inner.channel.add_disconnect_listener(Arc::new(move || {
            if let Some(link) = on_disconnect.upgrade() {
                link.close();
            }
        }));
        lock(&inner.listeners).extend([message_listener, disconnect_listener]);

        if !inner.channel.is_connected() {
            inner.close();
        }
        Self { inner }
    }

    /// Returns the underlying channel.
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.inner.channel
    }

    /// Returns `true` once the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of calls awaiting a terminal frame.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Issues a call, delivering its results to `sink`.
    ///
    /// Failures that occur before the request is posted (closed link,
    /// transformer rejection, reused id, post failure) are delivered to
    /// `sink` immediately and no frame is written.
    pub fn issue<S>(&self, operation: Operation, sink: S) -> CallHandle
    where
        S: Sink<CallResult, ClientError>,
    {
        let observer = Observer::from_sink(Arc::new(sink));
        let id = operation.id.clone().unwrap_or_else(|| self.inner.allocate_id());
        LinkInner::issue(&self.inner, id, operation, observer)
    }

    /// Disconnects the channel and fails every pending call.
    pub fn close(&self) {
        self.inner.channel.disconnect();
        self.inner.close();
    }
}

impl<C: Channel> LinkInner<C> {
    fn allocate_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn issue(
        this: &Arc<Self>,
        id: RequestId,
        operation: Operation,
        observer: CallObserver,
    ) -> CallHandle {
        let Operation {
            kind, path, input, ..
        } = operation;
        if this.closed.load(Ordering::SeqCst) {
            observer.error(ClientError::Disconnected);
            return CallHandle::detached(id);
        }
        let serialized = match input.map(|value| this.transformer.serialize(value)).transpose() {
            Ok(serialized) => serialized,
            Err(error) => {
                observer.error(ClientError::Transform(error));
                return CallHandle::detached(id);
            }
        };
        let Some(key) = this
            .pending
            .insert(id.clone(), kind, path.clone(), observer.clone())
        else {
            observer.error(ClientError::DuplicateId { id: id.clone() });
            return CallHandle::detached(id);
        };
        if this.closed.load(Ordering::SeqCst) {
            this.fail(&id, key, ClientError::Disconnected);
            return CallHandle::detached(id);
        }

        let frame = RequestFrame::call(id.clone(), kind, path.as_str(), serialized);
        let posted = Envelope::new(frame)
            .into_message()
            .map_err(|error| ClientError::Encode {
                path: path.clone(),
                message: error.to_string(),
            })
            .and_then(|message| this.channel.post(message).map_err(ClientError::from));
        if let Err(error) = posted {
            warn!(target: LINK_TARGET, %id, %path, error = %error, "failed to post request");
            this.fail(&id, key, error);
            return CallHandle::detached(id);
        }
        debug!(target: LINK_TARGET, %id, %kind, %path, "request posted");

        let weak = Arc::downgrade(this);
        let link: Weak<dyn CallCanceller> = weak;
        CallHandle {
            link: Some(link),
            id,
            key,
        }
    }

    fn fail(&self, id: &RequestId, key: u64, error: ClientError) {
        if let Some(call) = self.pending.remove_if(id, key) {
            call.observer.error(error);
        }
    }

    fn route(&self, message: &Value) {
        let frame = match decode::<ResponseFrame>(message) {
            Incoming::Ignored => return,
            Incoming::Malformed { id, error } => {
                debug!(target: LINK_TARGET, ?id, error = %error, "ignoring malformed response");
                return;
            }
            Incoming::Frame(frame) => frame,
        };
        let Some(call) = self.pending.get(&frame.id) else {
            debug!(target: LINK_TARGET, id = %frame.id, "ignoring response for unknown call");
            return;
        };
        match frame.body {
            ResponseBody::Error(raw) => self.deliver_error(&frame.id, &call, raw),
            ResponseBody::Result(payload) => self.deliver_result(&frame.id, &call, payload),
        }
    }

    fn deliver_error(&self, id: &RequestId, call: &PendingCall, raw: Value) {
        if self.pending.remove_if(id, call.key).is_none() {
            return;
        }
        let error = self
            .transformer
            .deserialize(raw)
            .map_err(|error| error.to_string())
            .and_then(|value| {
                serde_json::from_value::<ErrorShape>(value).map_err(|error| error.to_string())
            })
            .map_or_else(
                |message| ClientError::Decode {
                    path: call.path.clone(),
                    message,
                },
                |shape| ClientError::Remote { shape },
            );
        debug!(target: LINK_TARGET, %id, path = %call.path, "call failed remotely");
        call.observer.error(error);
    }

    fn deliver_result(&self, id: &RequestId, call: &PendingCall, payload: ResultPayload) {
        let kind = payload.effective_kind();
        let result = match kind {
            ResultKind::Started => CallResult::Started,
            ResultKind::Stopped => CallResult::Stopped,
            ResultKind::Data => {
                let raw = payload.data.unwrap_or(Value::Null);
                match self.transformer.deserialize(raw) {
                    Ok(value) => CallResult::Data(value),
                    Err(error) => {
                        if self.pending.remove_if(id, call.key).is_some() {
                            self.post_stop(id, call.kind);
                            call.observer.error(ClientError::Transform(error));
                        }
                        return;
                    }
                }
            }
        };

        let terminal = call.kind != CallKind::Subscription || kind == ResultKind::Stopped;
        if terminal && self.pending.remove_if(id, call.key).is_none() {
            return;
        }
        call.observer.next(result);
        if terminal {
            call.observer.complete();
        }
    }

    fn post_stop(&self, id: &RequestId, kind: CallKind) {
        if kind != CallKind::Subscription {
            return;
        }
        let posted = Envelope::new(RequestFrame::stop(id.clone()))
            .into_message()
            .map_err(|error| error.to_string())
            .and_then(|message| self.channel.post(message).map_err(|error| error.to_string()));
        match posted {
            Ok(()) => debug!(target: LINK_TARGET, %id, "subscription stop posted"),
            Err(error) => debug!(target: LINK_TARGET, %id, %error, "could not post subscription stop"),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach_listeners();
        let calls = self.pending.drain();
        debug!(target: LINK_TARGET, pending = calls.len(), "link closed");
        for call in calls {
            call.observer.error(ClientError::Disconnected);
        }
    }

    fn detach_listeners(&self) {
        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for listener in listeners {
            self.channel.remove_listener(listener);
        }
    }
}

impl<C: Channel> CallCanceller for LinkInner<C> {
    fn cancel(&self, id: &RequestId, key: u64) {
        if let Some(call) = self.pending.remove_if(id, key) {
            debug!(target: LINK_TARGET, %id, path = %call.path, "call cancelled");
            self.post_stop(id, call.kind);
            call.observer.complete();
        }
    }
}

impl<C: Channel> Drop for LinkInner<C> {
    fn drop(&mut self) {
        self.close();
    }
}
