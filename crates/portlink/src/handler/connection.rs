//! Per-channel request processing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use portlink_protocol::{
    CallKind, Envelope, Incoming, RequestFrame, RequestId, RequestParams, ResponseFrame, decode,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cleanup::CleanupStack;
use super::registry::{ActiveStream, CallSite, Gate, StreamEvent, SubscriptionRegistry};
use super::{ConnectionControl, ErrorDetails, HANDLER_TARGET, HandlerOptions};
use crate::channel::{Channel, ChannelInfo};
use crate::error::{HandlerError, ProcedureError};
use crate::observable::{Observable, Sink};
use crate::router::{ProcedureCall, ProcedureOutput};

/// State of one served channel.
pub(super) struct Connection<C: Channel, Ctx> {
    channel: C,
    options: Arc<HandlerOptions<Ctx>>,
    registry: SubscriptionRegistry,
    cleanup: CleanupStack,
    closed: AtomicBool,
}

impl<C: Channel, Ctx: 'static> Connection<C, Ctx> {
    /// Starts serving `channel`.
    ///
    /// The listeners hold the connection alive until the channel closes or
    /// the connection is shut down, whichever comes first.
    pub(super) fn open(channel: C, options: Arc<HandlerOptions<Ctx>>) -> Arc<Self> {
        let connection = Arc::new(Self {
            channel,
            options,
            registry: SubscriptionRegistry::new(),
            cleanup: CleanupStack::new(),
            closed: AtomicBool::new(false),
        });

        let serving = Arc::clone(&connection);
        let message_listener = connection.channel.add_message_listener(Arc::new(move |message| {
            serving.receive(message);
        }));
        let closing = Arc::clone(&connection);
        let disconnect_listener = connection
            .channel
            .add_disconnect_listener(Arc::new(move || closing.close()));

        let detach = Arc::downgrade(&connection);
        connection.cleanup.push(move || {
            if let Some(live) = detach.upgrade() {
                live.channel.remove_listener(message_listener);
                live.channel.remove_listener(disconnect_listener);
            }
        });
        let stop_all = Arc::downgrade(&connection);
        connection.cleanup.push(move || {
            if let Some(live) = stop_all.upgrade() {
                live.stop_all();
            }
        });

        info!(target: HANDLER_TARGET, port = %connection.channel.info(), "connection opened");
        if !connection.channel.is_connected() {
            connection.close();
        }
        connection
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanup.run();
        info!(target: HANDLER_TARGET, port = %self.channel.info(), "connection closed");
    }

    fn stop_all(&self) {
        for stream in self.registry.drain() {
            let finished = stream.gate().finish();
            if finished {
                debug!(target: HANDLER_TARGET, id = %stream.id, "subscription dropped on close");
            }
            stream.release();
        }
    }

    /// Entry point for every inbound message. Nothing raised here escapes
    /// to the channel.
    fn receive(self: &Arc<Self>, message: &Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(message)));
        if let Err(payload) = outcome {
            let error = ProcedureError::from_panic(payload.as_ref());
            warn!(target: HANDLER_TARGET, port = %self.channel.info(), %error, "message handling panicked");
        }
    }

    fn dispatch(self: &Arc<Self>, message: &Value) {
        let frame = match decode::<RequestFrame>(message) {
            Incoming::Ignored => return,
            // Frames without a method are responses meant for a link
            // sharing the channel.
            Incoming::Malformed { .. } if message.pointer("/trpc/method").is_none() => return,
            Incoming::Malformed { id: Some(id), error } => {
                warn!(target: HANDLER_TARGET, %id, %error, "malformed request frame");
                self.fail(&id, None, None, HandlerError::MalformedFrame(error).into());
                return;
            }
            Incoming::Malformed { id: None, error } => {
                warn!(target: HANDLER_TARGET, %error, "malformed request frame without a usable id");
                return;
            }
            Incoming::Frame(frame) => frame,
        };
        let RequestFrame {
            id,
            method,
            params: requested,
            ..
        } = frame;
        debug!(target: HANDLER_TARGET, %id, %method, "request received");
        let Some(kind) = method.call_kind() else {
            self.stop(&id);
            return;
        };
        let Some(params) = requested else {
            self.fail(&id, None, Some(kind), HandlerError::MissingParams.into());
            return;
        };
        self.call(id, kind, params);
    }

    fn call(self: &Arc<Self>, id: RequestId, kind: CallKind, params: RequestParams) {
        let RequestParams { path, input } = params;
        let decoded = match input.map(|raw| self.options.transformer.deserialize(raw)).transpose() {
            Ok(decoded) => decoded,
            Err(error) => {
                let site = CallSite {
                    kind,
                    path,
                    input: None,
                };
                self.fail(&id, Some(&site), Some(kind), HandlerError::Input(error).into());
                return;
            }
        };
        let site = CallSite {
            kind,
            path,
            input: decoded,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&site)))
            .unwrap_or_else(|payload| Err(ProcedureError::from_panic(payload.as_ref())));
        match outcome {
            Ok(ProcedureOutput::Value(value)) => self.respond(&id, &site, value),
            Ok(ProcedureOutput::Stream(stream)) => self.start_stream(id, site, stream),
            Err(error) => self.fail(&id, Some(&site), Some(kind), error),
        }
    }

    fn execute(&self, site: &CallSite) -> Result<ProcedureOutput, ProcedureError> {
        let ctx = (self.options.create_context)(self.channel.info())?;
        let procedure = self.options.router.resolve(&site.path)?;
        procedure.call(ProcedureCall {
            ctx: &ctx,
            input: site.input.clone(),
            path: &site.path,
            kind: site.kind,
        })
    }

    fn respond(&self, id: &RequestId, site: &CallSite, value: Value) {
        match self.options.transformer.serialize(value) {
            Ok(data) => self.post(ResponseFrame::data(id.clone(), data)),
            Err(error) => {
                self.fail(id, Some(site), Some(site.kind), HandlerError::Output(error).into());
            }
        }
    }

    fn start_stream(
        self: &Arc<Self>,
        id: RequestId,
        site: CallSite,
        stream: Observable<Value, ProcedureError>,
    ) {
        if let Some(previous) = self.registry.get(&id) {
            warn!(target: HANDLER_TARGET, %id, path = %site.path, "subscription id already active");
            self.stop_stream(&previous);
            self.registry.remove_if(&previous);
            self.fail(&id, Some(&site), Some(site.kind), HandlerError::DuplicateId.into());
            return;
        }
        let Some(active) = self.registry.reserve(id.clone(), site) else {
            return;
        };

        let sink = StreamSink {
            connection: Arc::downgrade(self),
            stream: Arc::clone(&active),
        };
        let subscription = match panic::catch_unwind(AssertUnwindSafe(|| stream.subscribe(sink))) {
            Ok(subscription) => subscription,
            Err(payload) => {
                self.registry.remove_if(&active);
                active.gate().finish();
                let error = ProcedureError::from_panic(payload.as_ref());
                self.fail(&id, Some(&active.site), Some(active.site.kind), error);
                return;
            }
        };
        active.attach(subscription);
        if active.gate().finished {
            return;
        }

        self.post(ResponseFrame::started(id));
        debug!(target: HANDLER_TARGET, id = %active.id, path = %active.site.path, "subscription started");
        self.open_gate(&active);
    }

    /// Writes `started`-gated events held while the subscription was set up.
    fn open_gate(&self, stream: &ActiveStream) {
        let mut gate = stream.gate();
        gate.open = true;
        let held = std::mem::take(&mut gate.held);
        let mut failures = Vec::new();
        for event in held {
            if gate.finished {
                break;
            }
            failures.extend(self.emit(stream, &mut gate, event));
        }
        let finished = gate.finished;
        drop(gate);
        self.settle(stream, finished, failures);
    }

    /// Writes one stream event. Called with the gate held so frames keep the
    /// order the producer emitted them in.
    fn emit(
        &self,
        stream: &ActiveStream,
        gate: &mut Gate,
        event: StreamEvent,
    ) -> Option<ProcedureError> {
        let id = stream.id.clone();
        match event {
            StreamEvent::Data(value) => match self.options.transformer.serialize(value) {
                Ok(data) => {
                    self.post(ResponseFrame::data(id, data));
                    None
                }
                Err(error) => self.end_with_error(stream, gate, HandlerError::Output(error).into()),
            },
            StreamEvent::Error(error) => self.end_with_error(stream, gate, error),
            StreamEvent::Complete => {
                if gate.finish() {
                    self.registry.remove_if(stream);
                    self.post(ResponseFrame::stopped(id));
                    debug!(target: HANDLER_TARGET, id = %stream.id, "subscription completed");
                }
                None
            }
        }
    }

    fn end_with_error(
        &self,
        stream: &ActiveStream,
        gate: &mut Gate,
        error: ProcedureError,
    ) -> Option<ProcedureError> {
        if !gate.finish() {
            return None;
        }
        self.registry.remove_if(stream);
        self.send_error(&stream.id, Some(&stream.site.path), &error);
        Some(error)
    }

    /// Runs the follow-up of an emission once the gate is released.
    fn settle(&self, stream: &ActiveStream, finished: bool, failures: Vec<ProcedureError>) {
        for error in failures {
            self.report(Some(&stream.site), Some(stream.site.kind), error);
        }
        if finished {
            stream.release();
        }
    }

    fn deliver(&self, stream: &ActiveStream, event: StreamEvent) {
        let mut gate = stream.gate();
        if gate.finished {
            return;
        }
        if !gate.open {
            gate.held.push(event);
            return;
        }
        let failure = self.emit(stream, &mut gate, event);
        let finished = gate.finished;
        drop(gate);
        self.settle(stream, finished, failure.into_iter().collect());
    }

    fn stop(&self, id: &RequestId) {
        let Some(stream) = self.registry.get(id) else {
            debug!(target: HANDLER_TARGET, %id, "stop for inactive subscription ignored");
            return;
        };
        debug!(target: HANDLER_TARGET, %id, "subscription stop requested");
        self.stop_stream(&stream);
        self.registry.remove_if(&stream);
    }

    /// Ends a stream at the caller's request: the producer is unsubscribed,
    /// then `stopped` is written. The registry entry outlives both.
    fn stop_stream(&self, stream: &ActiveStream) {
        let mut gate = stream.gate();
        if !gate.finish() {
            return;
        }
        let started = gate.open;
        drop(gate);
        stream.release();
        if started {
            self.post(ResponseFrame::stopped(stream.id.clone()));
        }
    }

    fn fail(
        &self,
        id: &RequestId,
        site: Option<&CallSite>,
        kind: Option<CallKind>,
        error: ProcedureError,
    ) {
        let path = site.map(|called| called.path.clone());
        self.report(site, kind, error.clone());
        self.send_error(id, path.as_deref(), &error);
    }

    fn report(&self, site: Option<&CallSite>, kind: Option<CallKind>, error: ProcedureError) {
        debug!(
            target: HANDLER_TARGET,
            path = site.map(|called| called.path.as_str()),
            code = %error.code(),
            reason = error.message(),
            "call failed"
        );
        let Some(reporter) = &self.options.on_error else {
            return;
        };
        let details = ErrorDetails {
            path: site.map(|called| called.path.clone()),
            kind,
            input: site.and_then(|called| called.input.clone()),
            error,
            channel: self.channel.info().clone(),
        };
        if panic::catch_unwind(AssertUnwindSafe(|| reporter.report(&details))).is_err() {
            warn!(target: HANDLER_TARGET, "error reporter panicked");
        }
    }

    fn send_error(&self, id: &RequestId, path: Option<&str>, error: &ProcedureError) {
        let shape = match serde_json::to_value(error.shape(path)) {
            Ok(shape) => shape,
            Err(encode) => {
                warn!(target: HANDLER_TARGET, %id, error = %encode, "failed to encode error shape");
                return;
            }
        };
        let wire = self
            .options
            .transformer
            .serialize(shape.clone())
            .unwrap_or_else(|transform| {
                warn!(target: HANDLER_TARGET, %id, error = %transform, "sending untransformed error shape");
                shape
            });
        self.post(ResponseFrame::error(id.clone(), wire));
    }

    fn post(&self, frame: ResponseFrame) {
        let id = frame.id.clone();
        let posted = Envelope::new(frame)
            .into_message()
            .map_err(|error| error.to_string())
            .and_then(|message| self.channel.post(message).map_err(|error| error.to_string()));
        match posted {
            Ok(()) => debug!(target: HANDLER_TARGET, %id, "response posted"),
            Err(error) => warn!(target: HANDLER_TARGET, %id, %error, "dropped response frame"),
        }
    }
}

impl<C: Channel, Ctx: 'static> ConnectionControl for Connection<C, Ctx> {
    fn info(&self) -> &ChannelInfo {
        self.channel.info()
    }

    fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.channel.disconnect();
        self.close();
    }
}

/// Forwards a procedure stream's events to its connection.
struct StreamSink<C: Channel, Ctx> {
    connection: Weak<Connection<C, Ctx>>,
    stream: Arc<ActiveStream>,
}

impl<C: Channel, Ctx: 'static> StreamSink<C, Ctx> {
    fn forward(&self, event: StreamEvent) {
        if let Some(connection) = self.connection.upgrade() {
            connection.deliver(&self.stream, event);
        }
    }
}

impl<C: Channel, Ctx: 'static> Sink<Value, ProcedureError> for StreamSink<C, Ctx> {
    fn next(&self, value: Value) {
        self.forward(StreamEvent::Data(value));
    }

    fn error(&self, error: ProcedureError) {
        self.forward(StreamEvent::Error(error));
    }

    fn complete(&self) {
        self.forward(StreamEvent::Complete);
    }
}
