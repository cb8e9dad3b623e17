//! Pending-call table keyed by correlation id.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use portlink_protocol::{CallKind, RequestId};

use super::CallResult;
use crate::error::ClientError;
use crate::observable::Observer;
use crate::sync::lock;

pub(super) type CallObserver = Observer<CallResult, ClientError>;

/// A call waiting for its terminal frame.
#[derive(Clone)]
pub(super) struct PendingCall {
    pub(super) key: u64,
    pub(super) kind: CallKind,
    pub(super) path: String,
    pub(super) observer: CallObserver,
}

/// Calls in flight on one link.
///
/// Each entry carries a unique key so a stale handle can never remove a
/// newer call that reused its id.
#[derive(Default)]
pub(super) struct PendingCalls {
    entries: Mutex<HashMap<RequestId, PendingCall>>,
    next_key: AtomicU64,
}

impl PendingCalls {
    /// Registers a call. Returns `None` when the id is already pending.
    pub(super) fn insert(
        &self,
        id: RequestId,
        kind: CallKind,
        path: String,
        observer: CallObserver,
    ) -> Option<u64> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        match lock(&self.entries).entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    key,
                    kind,
                    path,
                    observer,
                });
                Some(key)
            }
        }
    }

    pub(super) fn get(&self, id: &RequestId) -> Option<PendingCall> {
        lock(&self.entries).get(id).cloned()
    }

    /// Removes the entry for `id` only if it is still the call identified
    /// by `key`.
    pub(super) fn remove_if(&self, id: &RequestId, key: u64) -> Option<PendingCall> {
        let mut entries = lock(&self.entries);
        match entries.get(id) {
            Some(call) if call.key == key => entries.remove(id),
            _ => None,
        }
    }

    pub(super) fn drain(&self) -> Vec<PendingCall> {
        lock(&self.entries).drain().map(|(_, call)| call).collect()
    }

    pub(super) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
