//! One physical unit of fetch work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::delivery::DeliverySlot;
use crate::fingerprint::Fingerprint;
use crate::request::{ObserverToken, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Accepting observers; the underlying task is running or queued.
    Pending,
    /// Result is being fanned out. New requests start a fresh operation.
    Delivering,
    /// Last observer left; the task has been told to stop.
    Cancelled,
}

pub(crate) struct Observer {
    pub(crate) priority: Priority,
    pub(crate) coalesced: bool,
    pub(crate) slot: Arc<DeliverySlot>,
}

pub(crate) struct OperationState {
    pub(crate) phase: Phase,
    pub(crate) observers: HashMap<ObserverToken, Observer>,
}

impl OperationState {
    /// Highest priority among attached observers.
    pub(crate) fn effective_priority(&self) -> Priority {
        self.observers
            .values()
            .map(|observer| observer.priority)
            .max()
            .unwrap_or(Priority::Low)
    }
}

pub(crate) struct Operation {
    pub(crate) id: u64,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) cancellation: CancellationToken,
    pub(crate) priority: watch::Sender<Priority>,
    pub(crate) created_at: Instant,
    pub(crate) state: Mutex<OperationState>,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        fingerprint: Fingerprint,
        token: ObserverToken,
        observer: Observer,
    ) -> Self {
        let (priority, _) = watch::channel(observer.priority);
        let mut observers = HashMap::new();
        observers.insert(token, observer);

        Self {
            id,
            fingerprint,
            cancellation: CancellationToken::new(),
            priority,
            created_at: Instant::now(),
            state: Mutex::new(OperationState {
                phase: Phase::Pending,
                observers,
            }),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().phase == Phase::Pending
    }

    /// Raise the effective priority. Never lowers it.
    pub(crate) fn escalate(&self, priority: Priority) -> bool {
        self.priority.send_if_modified(|current| {
            if priority > *current {
                *current = priority;
                true
            } else {
                false
            }
        })
    }

    /// Set the effective priority after a recompute.
    pub(crate) fn set_priority(&self, priority: Priority) -> bool {
        self.priority.send_if_modified(|current| {
            if priority != *current {
                *current = priority;
                true
            } else {
                false
            }
        })
    }
}

/// Handle given to whoever runs an operation's underlying work.
///
/// The handle exposes cancellation and priority; it does not keep the
/// operation registered. Pass it back to
/// [`OperationRegistry::complete`](super::OperationRegistry::complete) with the result.
#[derive(Clone)]
pub struct OperationHandle {
    pub(crate) operation: Arc<Operation>,
}

impl OperationHandle {
    pub(crate) fn new(operation: Arc<Operation>) -> Self {
        Self { operation }
    }

    /// Registry-unique operation id. A fingerprint that is fetched again
    /// after its previous operation retired gets a new id.
    pub fn id(&self) -> u64 {
        self.operation.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.operation.fingerprint
    }

    /// Cancelled when the last observer detaches.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.operation.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.cancellation.is_cancelled()
    }

    /// Current effective priority.
    pub fn priority(&self) -> Priority {
        *self.operation.priority.borrow()
    }

    /// Receiver that sees every effective priority change.
    pub fn subscribe_priority(&self) -> watch::Receiver<Priority> {
        self.operation.priority.subscribe()
    }

    pub fn age(&self) -> Duration {
        self.operation.created_at.elapsed()
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.operation.id)
            .field("fingerprint", &self.operation.fingerprint)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
