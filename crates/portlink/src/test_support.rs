//! Shared helpers for unit and behavioural tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::channel::{Channel, Port};
use crate::error::ProcedureError;
use crate::observable::{Observable, Observer, Sink};

pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] elapses.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    condition()
}

/// Records every message delivered to a port.
#[derive(Clone, Default)]
pub(crate) struct FrameLog {
    messages: Arc<Mutex<Vec<Value>>>,
}

impl FrameLog {
    pub(crate) fn attach(port: &Port) -> Self {
        let log = Self::default();
        let messages = Arc::clone(&log.messages);
        port.add_message_listener(Arc::new(move |message| {
            messages.lock().expect("frame log lock").push(message.clone());
        }));
        log
    }

    pub(crate) fn snapshot(&self) -> Vec<Value> {
        self.messages.lock().expect("frame log lock").clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.lock().expect("frame log lock").len()
    }

    /// Waits for at least `count` messages and returns them.
    pub(crate) fn wait_for(&self, count: usize) -> Vec<Value> {
        assert!(
            wait_until(|| self.len() >= count),
            "expected {count} messages, got {:?}",
            self.snapshot()
        );
        self.snapshot()
    }
}

/// Event observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event<T, E> {
    Next(T),
    Error(E),
    Complete,
}

/// Sink that records every event it receives.
pub(crate) struct RecordingSink<T, E> {
    events: Arc<Mutex<Vec<Event<T, E>>>>,
}

impl<T, E> RecordingSink<T, E> {
    pub(crate) fn new() -> (Self, Recorded<T, E>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            Recorded { events },
        )
    }
}

impl<T, E> Sink<T, E> for RecordingSink<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn next(&self, value: T) {
        self.events.lock().expect("sink lock").push(Event::Next(value));
    }

    fn error(&self, error: E) {
        self.events.lock().expect("sink lock").push(Event::Error(error));
    }

    fn complete(&self) {
        self.events.lock().expect("sink lock").push(Event::Complete);
    }
}

/// Read side of a [`RecordingSink`].
pub(crate) struct Recorded<T, E> {
    events: Arc<Mutex<Vec<Event<T, E>>>>,
}

impl<T: Clone, E: Clone> Recorded<T, E> {
    pub(crate) fn events(&self) -> Vec<Event<T, E>> {
        self.events.lock().expect("sink lock").clone()
    }

    pub(crate) fn wait_for(&self, count: usize) -> Vec<Event<T, E>> {
        assert!(
            wait_until(|| self.events.lock().expect("sink lock").len() >= count),
            "expected {count} events"
        );
        self.events()
    }
}

/// Stream whose values are pushed by the test.
#[derive(Clone, Default)]
pub(crate) struct Feed {
    observer: Arc<Mutex<Option<Observer<u32, ProcedureError>>>>,
    teardowns: Arc<AtomicUsize>,
}

impl Feed {
    /// Returns a stream that hands its observer to this feed when
    /// subscribed.
    pub(crate) fn observable(&self) -> Observable<u32, ProcedureError> {
        let slot = Arc::clone(&self.observer);
        let teardowns = Arc::clone(&self.teardowns);
        Observable::new(move |observer| {
            *slot.lock().expect("feed lock") = Some(observer);
            Box::new(move || {
                teardowns.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    /// Waits for the stream to be subscribed and returns its observer.
    pub(crate) fn observer(&self) -> Observer<u32, ProcedureError> {
        assert!(wait_until(|| self.observer.lock().expect("feed lock").is_some()));
        self.observer
            .lock()
            .expect("feed lock")
            .clone()
            .expect("subscribed")
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}
