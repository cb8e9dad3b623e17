//! Typed, blocking facade over a [`Link`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portlink_config::Config;
use portlink_protocol::{CallKind, ResultKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::channel::Channel;
use crate::error::ClientError;
use crate::link::{CallHandle, CallResult, Link, Operation};
use crate::observable::Sink;
use crate::sync::lock;

const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

/// Typed caller for queries, mutations and subscriptions.
///
/// Queries and mutations block the calling thread until the result arrives
/// or the configured call timeout elapses. Subscriptions never block; their
/// events are delivered to callbacks on the channel's delivery thread.
pub struct Client<C: Channel> {
    link: Link<C>,
    call_timeout: Duration,
}

impl<C: Channel> Client<C> {
    /// Creates a client using the call timeout from `config`.
    #[must_use]
    pub fn new(link: Link<C>, config: &Config) -> Self {
        Self::with_timeout(link, config.call_timeout())
    }

    /// Creates a client with an explicit call timeout.
    #[must_use]
    pub const fn with_timeout(link: Link<C>, call_timeout: Duration) -> Self {
        Self { link, call_timeout }
    }

    /// Returns the underlying link.
    #[must_use]
    pub const fn link(&self) -> &Link<C> {
        &self.link
    }

    /// Runs a query and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the input cannot be encoded, the callee
    /// fails, the channel closes, the result cannot be decoded as `O`, or
    /// the call times out.
    pub fn query<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(CallKind::Query, path, input)
    }

    /// Runs a mutation and waits for its result.
    ///
    /// # Errors
    ///
    /// As for [`Client::query`].
    pub fn mutation<I, O>(&self, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call(CallKind::Mutation, path, input)
    }

    /// Opens a subscription, delivering its events to `callbacks`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Encode`] when the input cannot be encoded.
    /// Every later failure is delivered to the error callback.
    pub fn subscription<I, O>(
        &self,
        path: &str,
        input: &I,
        callbacks: SubscriptionCallbacks<O>,
    ) -> Result<CallHandle, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + 'static,
    {
        let encoded = encode_input(path, input)?;
        let abort = Arc::new(Abort::default());
        let sink = TypedSink {
            path: path.to_owned(),
            callbacks,
            abort: Arc::clone(&abort),
        };
        let handle = self.link.issue(
            Operation::new(CallKind::Subscription, path, encoded),
            sink,
        );
        abort.arm(&handle);
        Ok(handle)
    }

    fn call<I, O>(&self, kind: CallKind, path: &str, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let encoded = encode_input(path, input)?;
        let (sender, receiver) = mpsc::channel();
        let handle = self
            .link
            .issue(Operation::new(kind, path, encoded), OneShot { sender });
        let outcome = match receiver.recv_timeout(self.call_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                handle.unsubscribe();
                return Err(ClientError::Timeout {
                    path: path.to_owned(),
                    timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Disconnected),
        };
        match outcome {
            Outcome::Result(CallResult::Data(value)) => {
                serde_json::from_value(value).map_err(|error| ClientError::Decode {
                    path: path.to_owned(),
                    message: error.to_string(),
                })
            }
            Outcome::Result(CallResult::Started) => Err(unexpected(path, ResultKind::Started)),
            Outcome::Result(CallResult::Stopped) => Err(unexpected(path, ResultKind::Stopped)),
            Outcome::Error(error) => Err(error),
            Outcome::Complete => Err(ClientError::Disconnected),
        }
    }
}

fn unexpected(path: &str, kind: ResultKind) -> ClientError {
    ClientError::UnexpectedResult {
        path: path.to_owned(),
        kind,
    }
}

fn encode_input<I>(path: &str, input: &I) -> Result<Option<Value>, ClientError>
where
    I: Serialize + ?Sized,
{
    let value = serde_json::to_value(input).map_err(|error| ClientError::Encode {
        path: path.to_owned(),
        message: error.to_string(),
    })?;
    Ok((!value.is_null()).then_some(value))
}

enum Outcome {
    Result(CallResult),
    Error(ClientError),
    Complete,
}

struct OneShot {
    sender: Sender<Outcome>,
}

impl OneShot {
    fn deliver(&self, outcome: Outcome) {
        if self.sender.send(outcome).is_err() {
            debug!(target: CLIENT_TARGET, "caller stopped waiting for the result");
        }
    }
}

impl Sink<CallResult, ClientError> for OneShot {
    fn next(&self, value: CallResult) {
        self.deliver(Outcome::Result(value));
    }

    fn error(&self, error: ClientError) {
        self.deliver(Outcome::Error(error));
    }

    fn complete(&self) {
        self.deliver(Outcome::Complete);
    }
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Callbacks receiving the events of a typed subscription.
pub struct SubscriptionCallbacks<O> {
    on_data: Callback<O>,
    on_started: Option<Callback<()>>,
    on_error: Option<Callback<ClientError>>,
    on_complete: Option<Callback<()>>,
}

impl<O> SubscriptionCallbacks<O> {
    /// Creates callbacks that forward each decoded value to `on_data`.
    #[must_use]
    pub fn new<F>(on_data: F) -> Self
    where
        F: Fn(O) + Send + Sync + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_started: None,
            on_error: None,
            on_complete: None,
        }
    }

    /// Called once the callee has subscribed the stream.
    #[must_use]
    pub fn on_started<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_started = Some(Box::new(move |()| callback()));
        self
    }

    /// Called with a remote, transport or decoding failure.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Called once the stream has ended or was unsubscribed.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(move |()| callback()));
        self
    }
}

/// Lets a typed subscription end its own call when a value does not decode.
///
/// The sink may trip before [`Client::subscription`] has the handle; arming
/// afterwards cancels the call in that case.
#[derive(Default)]
struct Abort {
    tripped: AtomicBool,
    handle: Mutex<Option<CallHandle>>,
}

impl Abort {
    fn arm(&self, handle: &CallHandle) {
        *lock(&self.handle) = Some(handle.clone());
        if self.is_tripped() {
            handle.unsubscribe();
        }
    }

    /// Returns `true` for the first caller only.
    fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::SeqCst)
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        let handle = lock(&self.handle).clone();
        if let Some(armed) = handle {
            armed.unsubscribe();
        }
    }
}

struct TypedSink<O> {
    path: String,
    callbacks: SubscriptionCallbacks<O>,
    abort: Arc<Abort>,
}

impl<O> TypedSink<O> {
    fn report(&self, error: ClientError) {
        if let Some(callback) = &self.callbacks.on_error {
            callback(error);
            return;
        }
        debug!(target: CLIENT_TARGET, path = %self.path, %error, "unhandled subscription error");
    }
}

impl<O> Sink<CallResult, ClientError> for TypedSink<O>
where
    O: DeserializeOwned + 'static,
{
    fn next(&self, value: CallResult) {
        if self.abort.is_tripped() {
            return;
        }
        match value {
            CallResult::Started => {
                if let Some(callback) = &self.callbacks.on_started {
                    callback(());
                }
            }
            CallResult::Data(raw) => match serde_json::from_value::<O>(raw) {
                Ok(decoded) => (self.callbacks.on_data)(decoded),
                Err(error) => {
                    if !self.abort.trip() {
                        return;
                    }
                    self.report(ClientError::Decode {
                        path: self.path.clone(),
                        message: error.to_string(),
                    });
                    // Posts `subscription.stop`; the completion it causes is
                    // swallowed because the stream already failed.
                    self.abort.cancel();
                }
            },
            CallResult::Stopped => {}
        }
    }

    fn error(&self, error: ClientError) {
        if !self.abort.is_tripped() {
            self.report(error);
        }
    }

    fn complete(&self) {
        if self.abort.is_tripped() {
            return;
        }
        if let Some(callback) = &self.callbacks.on_complete {
            callback(());
        }
    }
}

#[cfg(test)]
mod tests;
