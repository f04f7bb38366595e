//! Operation registry: the request-coalescing core.
//!
//! Maps each [`Fingerprint`] to at most one live operation and tracks which
//! observer tokens are still interested in it.
//!
//! # Architecture
//!
//! ```text
//! view A (T1) ─┐ attach
//!              │                                   ┌─ deliver ─► T1 callback
//! view B (T2) ─┼──► OperationRegistry ──► start ──►│
//!              │      [F: op#7 {T1,T2,T3}]   task  ├─ deliver ─► T2 callback
//! view C (T3) ─┘                                   └─ deliver ─► T3 callback
//!
//! detach(T1), detach(T2), detach(T3) ──► set empty ──► cancel task, retire F
//! ```
//!
//! # Lifecycle
//!
//! `absent -> Pending -> {Delivering | Cancelled} -> absent`. Only `Pending`
//! operations accept new observers; a request that finds a retiring
//! operation starts a fresh one.
//!
//! # Locking
//!
//! Operations live in a sharded `DashMap`, so transitions are serialized per
//! fingerprint. Lock order is map shard, then operation state. The token
//! attachment map is only touched with no other lock held. Callbacks run
//! with no registry lock held.

mod delivery;
mod operation;

pub use delivery::{Delivery, Fetched, OperationCallback, OperationOutcome};
pub use operation::OperationHandle;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;
use crate::request::{ObserverToken, Priority};
use delivery::DeliverySlot;
use operation::{Observer, Operation, Phase};

/// Result of [`OperationRegistry::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A new operation was created and its start function called.
    Started,
    /// The observer joined an operation that was already pending.
    Joined,
}

impl AttachOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, AttachOutcome::Joined)
    }
}

/// Result of [`OperationRegistry::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The token was not attached to this fingerprint.
    NotAttached,
    /// The token was removed; other observers remain or the operation was
    /// already delivering.
    Detached,
    /// The token was the last observer; the operation was cancelled and retired.
    Cancelled,
}

/// Where an observer token is attached.
struct Attachment {
    operation: Arc<Operation>,
    slot: Arc<DeliverySlot>,
}

/// Registry of in-flight fetch operations.
pub struct OperationRegistry {
    operations: DashMap<Fingerprint, Arc<Operation>>,
    attachments: DashMap<ObserverToken, Attachment>,
    next_operation_id: AtomicU64,
    attaches: AtomicU64,
    joins: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    deliveries: AtomicU64,
}

/// Counters describing registry activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total attach calls
    pub attaches: u64,
    /// Attaches that joined an existing operation
    pub joins: u64,
    /// Operations created
    pub operations_started: u64,
    /// Operations that delivered a result (success or error)
    pub operations_completed: u64,
    /// Operations cancelled because their last observer left
    pub operations_cancelled: u64,
    /// Callbacks invoked by completions
    pub deliveries: u64,
}

impl RegistryStats {
    /// Fraction of attaches that were served by existing work (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.attaches == 0 {
            0.0
        } else {
            self.joins as f64 / self.attaches as f64
        }
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
            attachments: DashMap::new(),
            next_operation_id: AtomicU64::new(1),
            attaches: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    /// Attach `token` to the operation for `fingerprint`.
    ///
    /// If no pending operation exists one is created and `start` is called
    /// with its handle, after all registry locks are released. Joining a
    /// pending operation escalates its priority if `priority` is higher.
    ///
    /// A token attached to a different operation is detached first. A token
    /// already attached to this pending operation has its callback replaced.
    pub fn attach<F>(
        &self,
        fingerprint: Fingerprint,
        token: ObserverToken,
        priority: Priority,
        callback: OperationCallback,
        start: F,
    ) -> AttachOutcome
    where
        F: FnOnce(OperationHandle),
    {
        self.attaches.fetch_add(1, Ordering::Relaxed);
        self.release_stale_attachment(token, &fingerprint);

        let slot = Arc::new(DeliverySlot::new(callback));
        let mut replaced = None;

        let (operation, outcome) = match self.operations.entry(fingerprint) {
            Entry::Occupied(mut entry) => {
                let existing = Arc::clone(entry.get());
                let mut state = existing.state.lock();
                if state.phase == Phase::Pending {
                    let previous = state.observers.insert(
                        token,
                        Observer {
                            priority,
                            coalesced: true,
                            slot: Arc::clone(&slot),
                        },
                    );
                    replaced = previous.map(|observer| observer.slot);
                    existing.escalate(priority);
                    drop(state);
                    (existing, AttachOutcome::Joined)
                } else {
                    drop(state);
                    let operation = self.create_operation(
                        entry.key().clone(),
                        token,
                        priority,
                        Arc::clone(&slot),
                    );
                    entry.insert(Arc::clone(&operation));
                    (operation, AttachOutcome::Started)
                }
            }
            Entry::Vacant(entry) => {
                let operation =
                    self.create_operation(entry.key().clone(), token, priority, Arc::clone(&slot));
                entry.insert(Arc::clone(&operation));
                (operation, AttachOutcome::Started)
            }
        };

        self.attachments.insert(
            token,
            Attachment {
                operation: Arc::clone(&operation),
                slot,
            },
        );
        // Completion may have drained this operation before the attachment
        // existed; in that case it will never clean the entry up.
        if !operation.is_pending() {
            self.attachments
                .remove_if(&token, |_, attachment| attachment.operation.id == operation.id);
        }

        if let Some(previous) = replaced {
            previous.revoke();
        }

        match outcome {
            AttachOutcome::Joined => {
                self.joins.fetch_add(1, Ordering::Relaxed);
                debug!(
                    fingerprint = %operation.fingerprint,
                    operation = operation.id,
                    token = %token,
                    priority = %priority,
                    "Joined in-flight operation"
                );
            }
            AttachOutcome::Started => {
                self.started.fetch_add(1, Ordering::Relaxed);
                debug!(
                    fingerprint = %operation.fingerprint,
                    operation = operation.id,
                    token = %token,
                    priority = %priority,
                    in_flight = self.operations.len(),
                    "Started operation"
                );
                start(OperationHandle::new(operation));
            }
        }

        outcome
    }

    /// Detach `token` from the operation for `fingerprint`.
    ///
    /// When the token was the last observer of a pending operation, the
    /// operation is cancelled and removed before this returns. Once this
    /// returns the token's callback will not be invoked.
    ///
    /// Blocks while the token's callback is running on another thread, for
    /// no longer than that callback takes. From inside the callback it
    /// returns at once.
    pub fn detach(&self, fingerprint: &Fingerprint, token: ObserverToken) -> DetachOutcome {
        match self.attachments.remove_if(&token, |_, attachment| {
            attachment.operation.fingerprint == *fingerprint
        }) {
            Some((_, attachment)) => self.release(token, attachment),
            None => DetachOutcome::NotAttached,
        }
    }

    /// Detach `token` from whatever operation it is attached to.
    ///
    /// Used when a token's new request is served without the registry, such
    /// as a memory cache hit.
    pub fn detach_token(&self, token: ObserverToken) -> DetachOutcome {
        match self.attachments.remove(&token) {
            Some((_, attachment)) => self.release(token, attachment),
            None => DetachOutcome::NotAttached,
        }
    }

    /// Detach `token` if it is attached anywhere other than the pending
    /// operation for `fingerprint`.
    fn release_stale_attachment(
        &self,
        token: ObserverToken,
        fingerprint: &Fingerprint,
    ) -> DetachOutcome {
        let current = match self.attachments.get(&token) {
            Some(attachment) => Arc::clone(&attachment.operation),
            None => return DetachOutcome::NotAttached,
        };

        if current.fingerprint == *fingerprint && current.is_pending() {
            return DetachOutcome::NotAttached;
        }

        match self
            .attachments
            .remove_if(&token, |_, attachment| attachment.operation.id == current.id)
        {
            Some((_, attachment)) => self.release(token, attachment),
            None => DetachOutcome::NotAttached,
        }
    }

    /// Fan `outcome` out to every attached observer, then retire the operation.
    ///
    /// Returns the number of callbacks invoked. A cancelled or already
    /// completed operation delivers nothing.
    pub fn complete(&self, handle: &OperationHandle, outcome: OperationOutcome) -> usize {
        let operation = &handle.operation;
        let observers: Vec<_> = {
            let mut state = operation.state.lock();
            if state.phase != Phase::Pending {
                return 0;
            }
            state.phase = Phase::Delivering;
            state.observers.drain().collect()
        };

        self.operations
            .remove_if(&operation.fingerprint, |_, registered| registered.id == operation.id);
        self.completed.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for (token, observer) in observers {
            let delivery = Delivery {
                outcome: outcome.clone(),
                coalesced: observer.coalesced,
            };
            if observer.slot.deliver(delivery) {
                delivered += 1;
            }
            self.attachments
                .remove_if(&token, |_, attachment| attachment.operation.id == operation.id);
        }
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);

        debug!(
            fingerprint = %operation.fingerprint,
            operation = operation.id,
            delivered,
            success = outcome.is_ok(),
            elapsed_ms = operation.created_at.elapsed().as_millis() as u64,
            "Operation completed"
        );

        delivered
    }

    /// Returns true if a pending operation exists for `fingerprint`.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.operations
            .get(fingerprint)
            .is_some_and(|operation| operation.is_pending())
    }

    /// Number of observers attached to the pending operation for `fingerprint`.
    pub fn observer_count(&self, fingerprint: &Fingerprint) -> usize {
        self.operations.get(fingerprint).map_or(0, |operation| {
            let state = operation.state.lock();
            if state.phase == Phase::Pending {
                state.observers.len()
            } else {
                0
            }
        })
    }

    /// Effective priority of the operation for `fingerprint`, if registered.
    pub fn operation_priority(&self, fingerprint: &Fingerprint) -> Option<Priority> {
        self.operations
            .get(fingerprint)
            .map(|operation| *operation.priority.borrow())
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of tokens currently attached to some operation.
    pub fn attached_tokens(&self) -> usize {
        self.attachments.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            attaches: self.attaches.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            operations_started: self.started.load(Ordering::Relaxed),
            operations_completed: self.completed.load(Ordering::Relaxed),
            operations_cancelled: self.cancelled.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            attaches = stats.attaches,
            joins = stats.joins,
            started = stats.operations_started,
            completed = stats.operations_completed,
            cancelled = stats.operations_cancelled,
            in_flight = self.len(),
            coalescing_ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            "Operation registry statistics"
        );
    }

    fn create_operation(
        &self,
        fingerprint: Fingerprint,
        token: ObserverToken,
        priority: Priority,
        slot: Arc<DeliverySlot>,
    ) -> Arc<Operation> {
        let id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Operation::new(
            id,
            fingerprint,
            token,
            Observer {
                priority,
                coalesced: false,
                slot,
            },
        ))
    }

    /// Remove a detached token from its operation and disarm its callback.
    fn release(&self, token: ObserverToken, attachment: Attachment) -> DetachOutcome {
        let operation = attachment.operation;
        let emptied = {
            let mut state = operation.state.lock();
            let owned = state
                .observers
                .get(&token)
                .is_some_and(|observer| Arc::ptr_eq(&observer.slot, &attachment.slot));
            if owned {
                state.observers.remove(&token);
            }

            if owned && state.phase == Phase::Pending {
                if state.observers.is_empty() {
                    state.phase = Phase::Cancelled;
                    true
                } else {
                    operation.set_priority(state.effective_priority());
                    false
                }
            } else {
                false
            }
        };

        attachment.slot.revoke();

        if !emptied {
            debug!(
                fingerprint = %operation.fingerprint,
                operation = operation.id,
                token = %token,
                "Observer detached"
            );
            return DetachOutcome::Detached;
        }

        operation.cancellation.cancel();
        self.operations
            .remove_if(&operation.fingerprint, |_, registered| registered.id == operation.id);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(
            fingerprint = %operation.fingerprint,
            operation = operation.id,
            token = %token,
            "Last observer detached - operation cancelled"
        );
        DetachOutcome::Cancelled
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
