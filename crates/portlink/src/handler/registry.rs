//! Active subscriptions of one connection.
//!
//! Each entry moves `absent -> active -> absent` once. Entries carry a
//! generation so that a late event from a stream that has already been
//! replaced can never remove its successor.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use portlink_protocol::{CallKind, RequestId};
use serde_json::Value;

use crate::error::ProcedureError;
use crate::observable::Subscription;
use crate::sync::lock;

/// Where a call was aimed, kept for error reports.
#[derive(Debug, Clone)]
pub(super) struct CallSite {
    pub(super) kind: CallKind,
    pub(super) path: String,
    pub(super) input: Option<Value>,
}

/// Event emitted by a procedure stream.
pub(super) enum StreamEvent {
    Data(Value),
    Error(ProcedureError),
    Complete,
}

/// Delivery state of one stream.
///
/// Events are held back until the `started` frame has been written, and
/// `finished` flips exactly once, under this lock, whichever path ends the
/// stream.
#[derive(Default)]
pub(super) struct Gate {
    pub(super) open: bool,
    pub(super) finished: bool,
    pub(super) held: Vec<StreamEvent>,
}

impl Gate {
    /// Marks the stream finished. Returns `false` if it already was.
    pub(super) const fn finish(&mut self) -> bool {
        !mem::replace(&mut self.finished, true)
    }
}

/// A subscribed stream registered under its request id.
pub(super) struct ActiveStream {
    pub(super) id: RequestId,
    pub(super) site: CallSite,
    generation: u64,
    gate: Mutex<Gate>,
    subscription: Mutex<Option<Subscription>>,
}

impl ActiveStream {
    pub(super) fn gate(&self) -> MutexGuard<'_, Gate> {
        lock(&self.gate)
    }

    /// Stores the subscription handle once the producer has started.
    ///
    /// A stream that finished in the meantime is unsubscribed at once.
    pub(super) fn attach(&self, subscription: Subscription) {
        *lock(&self.subscription) = Some(subscription);
        if self.gate().finished {
            self.release();
        }
    }

    /// Unsubscribes the producer and drops the handle.
    ///
    /// Must not be called with the gate held: the producer's teardown may
    /// wait for an emission that needs it.
    pub(super) fn release(&self) {
        let attached = lock(&self.subscription).take();
        if let Some(subscription) = attached {
            subscription.unsubscribe();
        }
    }
}

/// Per-connection map of request id to active stream.
pub(super) struct SubscriptionRegistry {
    entries: Mutex<HashMap<RequestId, Arc<ActiveStream>>>,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub(super) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Registers a new stream under `id`. Returns `None` if `id` is taken.
    pub(super) fn reserve(&self, id: RequestId, site: CallSite) -> Option<Arc<ActiveStream>> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        match lock(&self.entries).entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let stream = Arc::new(ActiveStream {
                    id,
                    site,
                    generation,
                    gate: Mutex::new(Gate::default()),
                    subscription: Mutex::new(None),
                });
                slot.insert(Arc::clone(&stream));
                Some(stream)
            }
        }
    }

    pub(super) fn get(&self, id: &RequestId) -> Option<Arc<ActiveStream>> {
        lock(&self.entries).get(id).cloned()
    }

    /// Removes `stream` if it is still the entry registered under its id.
    pub(super) fn remove_if(&self, stream: &ActiveStream) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(&stream.id) {
            Some(current) if current.generation == stream.generation => {
                entries.remove(&stream.id);
                true
            }
            _ => false,
        }
    }

    pub(super) fn drain(&self) -> Vec<Arc<ActiveStream>> {
        lock(&self.entries).drain().map(|(_, stream)| stream).collect()
    }

    pub(super) fn contains(&self, id: &RequestId) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub(super) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
