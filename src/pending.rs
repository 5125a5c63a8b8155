//! Pending-call table: correlation id -> reply slot of the waiting caller.
//!
//! Inserted by the stub's sender loop when an invocation goes out, removed
//! by the receiver loop when the matching response comes back. An id is
//! removed exactly once, so a reply slot is fulfilled at most once; a
//! duplicate or late response simply finds nothing.
//!
//! Once closed, the table refuses new entries. Every caller still waiting
//! at that moment is answered, and a call that races past the close is
//! answered immediately instead of being stranded.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RiiError};

/// Where a caller waits for its outcome.
pub type ReplySlot = oneshot::Sender<Result<Bytes>>;

#[derive(Default)]
struct Inner {
    slots: HashMap<u64, ReplySlot>,
    closed: bool,
}

/// Outstanding calls of one stub.
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a reply slot for `id`.
    ///
    /// Hands the slot back if the table is closed or `id` is already taken.
    pub fn insert(&self, id: u64, slot: ReplySlot) -> std::result::Result<(), ReplySlot> {
        let mut inner = self.lock();
        if inner.closed || inner.slots.contains_key(&id) {
            return Err(slot);
        }
        inner.slots.insert(id, slot);
        Ok(())
    }

    /// Remove and return the reply slot for `id`.
    pub fn complete(&self, id: u64) -> Option<ReplySlot> {
        self.lock().slots.remove(&id)
    }

    /// Drop entries whose caller stopped waiting. Returns how many went.
    pub fn prune_abandoned(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !slot.is_closed());
        before - inner.slots.len()
    }

    /// Drop the entry for `id` if its caller already stopped waiting.
    ///
    /// Returns whether the entry went.
    pub fn discard_abandoned(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let abandoned = inner.slots.get(&id).is_some_and(|slot| slot.is_closed());
        if abandoned {
            inner.slots.remove(&id);
        }
        abandoned
    }

    /// Close the table and answer every waiter with `make_err()`.
    pub fn close_all(&self, make_err: impl Fn() -> RiiError) -> usize {
        let drained: Vec<ReplySlot> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.slots.drain().map(|(_, slot)| slot).collect()
        };

        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(make_err()));
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Check if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close_all` has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
