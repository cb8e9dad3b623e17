//! Minimal push streams.
//!
//! Procedures return an [`Observable`] when they produce a stream of values.
//! Subscribing hands the producer an [`Observer`]; the producer pushes values
//! until it signals completion or an error, or until the consumer
//! unsubscribes. Whichever comes first closes the observer, after which
//! further emissions are dropped and the producer's teardown runs exactly
//! once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::sync::lock;

/// Cleanup returned by a producer, run once when the stream closes.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Receiver of stream events.
///
/// Calls for one stream are serialised: an implementation never sees two at
/// once, and nothing follows the terminal call.
pub trait Sink<T, E>: Send + Sync + 'static {
    /// Receives the next value.
    fn next(&self, value: T);

    /// Receives the terminal error.
    fn error(&self, error: E);

    /// Receives the terminal completion.
    fn complete(&self);
}

/// Serialises calls into a sink across threads.
///
/// Re-entry from the thread already delivering is let through, so a sink
/// may unsubscribe its own stream from inside a callback.
#[derive(Default)]
struct DeliveryLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl DeliveryLock {
    /// Returns `None` when the current thread already holds the lock.
    fn enter(&self) -> Option<DeliveryGuard<'_>> {
        let current = thread::current().id();
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                Some(holder) if holder == current => return None,
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                None => break,
            }
        }
        *owner = Some(current);
        Some(DeliveryGuard { held: self })
    }
}

struct DeliveryGuard<'a> {
    held: &'a DeliveryLock,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.held.owner) = None;
        self.held.released.notify_one();
    }
}

struct ObserverState<T, E> {
    closed: AtomicBool,
    delivery: DeliveryLock,
    sink: Arc<dyn Sink<T, E>>,
    teardown: Mutex<Option<Teardown>>,
}

impl<T, E> ObserverState<T, E> {
    fn run_teardown(&self) {
        let pending = lock(&self.teardown).take();
        if let Some(teardown) = pending {
            teardown();
        }
    }

    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Producer-side handle used to push events to a subscriber.
pub struct Observer<T, E> {
    state: Arc<ObserverState<T, E>>,
}

impl<T, E> Clone for Observer<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> Observer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn from_sink(sink: Arc<dyn Sink<T, E>>) -> Self {
        Self {
            state: Arc::new(ObserverState {
                closed: AtomicBool::new(false),
                delivery: DeliveryLock::default(),
                sink,
                teardown: Mutex::new(None),
            }),
        }
    }

    /// Pushes a value. Ignored once the observer is closed.
    pub fn next(&self, value: T) {
        let _delivering = self.state.delivery.enter();
        if !self.is_closed() {
            self.state.sink.next(value);
        }
    }

    /// Ends the stream with an error. Ignored once the observer is closed.
    pub fn error(&self, error: E) {
        let delivering = self.state.delivery.enter();
        if !self.state.close() {
            return;
        }
        self.state.sink.error(error);
        drop(delivering);
        self.state.run_teardown();
    }

    /// Ends the stream normally. Ignored once the observer is closed.
    ///
    /// Waits for a value being delivered on another thread, so once this
    /// returns the sink sees nothing more.
    pub fn complete(&self) {
        let delivering = self.state.delivery.enter();
        if !self.state.close() {
            return;
        }
        self.state.sink.complete();
        drop(delivering);
        self.state.run_teardown();
    }

    /// Returns `true` once the stream has ended or the consumer has
    /// unsubscribed. Long-running producers poll this to stop early.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn install_teardown(&self, teardown: Teardown) {
        *lock(&self.state.teardown) = Some(teardown);
        if self.is_closed() {
            self.state.run_teardown();
        }
    }
}

trait Closeable: Send + Sync {
    fn unsubscribe(&self);
    fn is_closed(&self) -> bool;
}

impl<T, E> Closeable for ObserverState<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn unsubscribe(&self) {
        let delivering = self.delivery.enter();
        let closed = self.close();
        drop(delivering);
        if closed {
            self.run_teardown();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Consumer-side handle to an active stream.
///
/// Unsubscribing closes the stream without notifying the sink and runs the
/// producer's teardown. Repeated calls have no effect.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<dyn Closeable>,
}

impl Subscription {
    /// Stops the stream.
    pub fn unsubscribe(&self) {
        self.state.unsubscribe();
    }

    /// Returns `true` once the stream has ended or was unsubscribed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

type Producer<T, E> = Box<dyn FnOnce(Observer<T, E>) -> Teardown + Send>;

/// Lazily started stream of `T` values that may fail with `E`.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use portlink::observable::{Observable, Teardown};
///
/// let ticks: Observable<u32, String> = Observable::new(|observer| {
///     thread::spawn(move || {
///         for tick in 0..3 {
///             observer.next(tick);
///         }
///         observer.complete();
///     });
///     Box::new(|| {}) as Teardown
/// });
/// # drop(ticks);
/// ```
pub struct Observable<T, E> {
    producer: Producer<T, E>,
}

impl<T, E> fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable").finish_non_exhaustive()
    }
}

impl<T, E> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a stream from a producer. The producer runs on
    /// [`Observable::subscribe`] and returns the teardown to run when the
    /// stream closes.
    pub fn new<F>(producer: F) -> Self
    where
        F: FnOnce(Observer<T, E>) -> Teardown + Send + 'static,
    {
        Self {
            producer: Box::new(producer),
        }
    }

    /// Creates a stream that emits `values` synchronously, then completes.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let source = values.into_iter();
        Self::new(move |observer| {
            for value in source {
                if observer.is_closed() {
                    break;
                }
                observer.next(value);
            }
            observer.complete();
            Box::new(|| {})
        })
    }

    /// Creates a stream that fails immediately.
    pub fn fail(error: E) -> Self {
        Self::new(move |observer| {
            observer.error(error);
            Box::new(|| {})
        })
    }

    /// Starts the producer, delivering its events to `sink`.
    pub fn subscribe<S>(self, sink: S) -> Subscription
    where
        S: Sink<T, E>,
    {
        self.subscribe_shared(Arc::new(sink))
    }

    pub(crate) fn subscribe_shared(self, sink: Arc<dyn Sink<T, E>>) -> Subscription {
        let observer = Observer::from_sink(sink);
        let teardown = (self.producer)(observer.clone());
        observer.install_teardown(teardown);
        Subscription {
            state: observer.state,
        }
    }

    /// Maps every value through a fallible function. A mapping failure ends
    /// the stream with that error and unsubscribes from the source.
    pub fn try_map<U, F>(self, map: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        Observable::new(move |observer: Observer<U, E>| {
            let subscription = self.subscribe(MapSink {
                observer,
                map,
            });
            Box::new(move || subscription.unsubscribe())
        })
    }
}

struct MapSink<U, E, F> {
    observer: Observer<U, E>,
    map: F,
}

impl<T, U, E, F> Sink<T, E> for MapSink<U, E, F>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
{
    fn next(&self, value: T) {
        match (self.map)(value) {
            Ok(mapped) => self.observer.next(mapped),
            Err(error) => self.observer.error(error),
        }
    }

    fn error(&self, error: E) {
        self.observer.error(error);
    }

    fn complete(&self) {
        self.observer.complete();
    }
}
