//! One-shot delivery slots.
//!
//! Each attached observer owns a slot holding its callback. Completion and
//! detach race on the slot; whichever takes it first decides whether the
//! callback runs. A detach that loses the race to a running delivery waits
//! for it, so once `revoke` returns the callback will never be invoked.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::FetchError;
use crate::result::{Bitmap, FulfillmentType};

/// A decoded image plus where its bytes came from.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub image: Bitmap,
    pub fulfillment: FulfillmentType,
}

/// What an operation produced, shared by every observer.
pub type OperationOutcome = Result<Fetched, FetchError>;

/// Per-observer view of an operation's outcome.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub outcome: OperationOutcome,
    /// The observer joined an operation someone else started.
    pub coalesced: bool,
}

/// Callback registered by an observer.
pub type OperationCallback = Box<dyn FnOnce(Delivery) + Send + 'static>;

enum SlotState {
    Armed(OperationCallback),
    Delivering(ThreadId),
    Done,
}

pub(crate) struct DeliverySlot {
    state: Mutex<SlotState>,
    finished: Condvar,
}

impl DeliverySlot {
    pub(crate) fn new(callback: OperationCallback) -> Self {
        Self {
            state: Mutex::new(SlotState::Armed(callback)),
            finished: Condvar::new(),
        }
    }

    /// Run the callback if the slot is still armed.
    ///
    /// Returns `true` if the callback was invoked. A panicking callback is
    /// logged and counts as delivered.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        let callback = {
            let mut state = self.state.lock();
            match mem::replace(&mut *state, SlotState::Done) {
                SlotState::Armed(callback) => {
                    *state = SlotState::Delivering(thread::current().id());
                    callback
                }
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| callback(delivery))).is_err() {
            warn!("Fetch callback panicked during delivery");
        }

        *self.state.lock() = SlotState::Done;
        self.finished.notify_all();
        true
    }

    /// Disarm the slot.
    ///
    /// Blocks while another thread is running the callback. Returns at once
    /// when called from inside the callback itself.
    pub(crate) fn revoke(&self) {
        let current = thread::current().id();
        let mut state = self.state.lock();
        let revoked = loop {
            match &*state {
                SlotState::Armed(_) => break Some(mem::replace(&mut *state, SlotState::Done)),
                SlotState::Delivering(thread) if *thread != current => {
                    self.finished.wait(&mut state)
                }
                _ => break None,
            }
        };
        drop(state);
        // The callback may own arbitrary captures; drop it outside the lock
        drop(revoked);
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Done)
    }
}
