//! Priority-aware download admission.
//!
//! Limits how many operations download at once. Waiting operations are
//! admitted normal priority first, FIFO within a priority class. A waiting
//! operation follows its effective priority through a `watch` channel, so a
//! low-priority prefetch that a visible view joins moves ahead of the queue
//! while it is still waiting.
//!
//! # Low-priority admission
//!
//! - [`LowPriorityAdmission::WhenIdle`]: low work takes any free slot that
//!   no normal work is waiting for.
//! - [`LowPriorityAdmission::Capped`]: additionally, at most `n` low
//!   priority downloads run at once, keeping slots free for bursts of
//!   normal work.
//!
//! # Example
//!
//! ```ignore
//! let scheduler = DownloadScheduler::new(8, LowPriorityAdmission::WhenIdle);
//! let permit = scheduler.acquire(handle.subscribe_priority()).await;
//! let bytes = transport.download(url).await;
//! drop(permit); // admits the next waiter
//! ```

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::trace;

use crate::request::Priority;

// =============================================================================
// Admission policy
// =============================================================================

/// How low-priority downloads share capacity with normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LowPriorityAdmission {
    /// Low priority uses whatever capacity normal work leaves idle.
    #[default]
    WhenIdle,
    /// At most this many low-priority downloads at once.
    Capped(usize),
}

impl fmt::Display for LowPriorityAdmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowPriorityAdmission::WhenIdle => write!(f, "idle"),
            LowPriorityAdmission::Capped(limit) => write!(f, "{}", limit),
        }
    }
}

// =============================================================================
// Queue state
// =============================================================================

/// Normal sorts before Low, then by arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<Priority>,
    sequence: u64,
}

impl QueueKey {
    fn priority(&self) -> Priority {
        self.rank.0
    }
}

type Waiter = oneshot::Sender<AdmissionPermit>;

#[derive(Default)]
struct QueueState {
    active_normal: usize,
    active_low: usize,
    waiting: BTreeMap<QueueKey, Waiter>,
    next_sequence: u64,
}

impl QueueState {
    fn active(&self) -> usize {
        self.active_normal + self.active_low
    }

    fn occupy(&mut self, class: Priority) {
        match class {
            Priority::Normal => self.active_normal += 1,
            Priority::Low => self.active_low += 1,
        }
    }

    fn vacate(&mut self, class: Priority) {
        match class {
            Priority::Normal => self.active_normal = self.active_normal.saturating_sub(1),
            Priority::Low => self.active_low = self.active_low.saturating_sub(1),
        }
    }

    fn enqueue(&mut self, priority: Priority, waiter: Waiter) -> QueueKey {
        let key = QueueKey {
            rank: Reverse(priority),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.waiting.insert(key, waiter);
        key
    }

    /// Pop every waiter that can be admitted right now.
    fn take_admissible(&mut self, capacity: usize, low_limit: usize) -> Vec<(Waiter, Priority)> {
        let mut grants = Vec::new();
        while self.active() < capacity {
            let Some(entry) = self.waiting.first_entry() else {
                break;
            };
            let class = entry.key().priority();
            // Everything behind a blocked low waiter is also low
            if class == Priority::Low && self.active_low >= low_limit {
                break;
            }
            grants.push((entry.remove(), class));
            self.occupy(class);
        }
        grants
    }
}

struct Shared {
    capacity: usize,
    low_limit: usize,
    state: Mutex<QueueState>,
    peak_in_flight: AtomicUsize,
    admitted: AtomicU64,
}

impl Shared {
    fn record_admission(&self, count: usize, in_flight: usize) {
        self.admitted.fetch_add(count as u64, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }
}

/// Hand permits to admissible waiters.
fn dispatch(shared: &Arc<Shared>) {
    loop {
        let (grants, in_flight) = {
            let mut state = shared.state.lock();
            let grants = state.take_admissible(shared.capacity, shared.low_limit);
            (grants, state.active())
        };
        if grants.is_empty() {
            return;
        }
        shared.record_admission(grants.len(), in_flight);

        // Waiters whose receiver is gone hand their slot straight back
        let mut returned = Vec::new();
        for (waiter, class) in grants {
            let permit = AdmissionPermit {
                shared: Some(Arc::clone(shared)),
                class,
            };
            if let Err(mut permit) = waiter.send(permit) {
                permit.shared = None;
                returned.push(class);
            }
        }
        if returned.is_empty() {
            return;
        }

        let mut state = shared.state.lock();
        for class in returned {
            state.vacate(class);
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Bounded, priority-ordered admission for downloads.
///
/// Cloning shares the same capacity.
#[derive(Clone)]
pub struct DownloadScheduler {
    shared: Arc<Shared>,
}

impl DownloadScheduler {
    /// Create a scheduler admitting at most `capacity` downloads at once.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, low_priority: LowPriorityAdmission) -> Self {
        let capacity = capacity.max(1);
        let low_limit = match low_priority {
            LowPriorityAdmission::WhenIdle => capacity,
            LowPriorityAdmission::Capped(limit) => limit.min(capacity),
        };

        Self {
            shared: Arc::new(Shared {
                capacity,
                low_limit,
                state: Mutex::new(QueueState::default()),
                peak_in_flight: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a download slot.
    ///
    /// `priority` carries the caller's effective priority; changes while
    /// waiting move the caller within the queue. Dropping the returned future
    /// leaves the queue without consuming a slot.
    pub async fn acquire(&self, mut priority: watch::Receiver<Priority>) -> AdmissionPermit {
        let mut current = *priority.borrow_and_update();
        let mut watching = true;
        let mut queued = self.enqueue(current);

        loop {
            tokio::select! {
                granted = &mut queued.receiver => match granted {
                    Ok(permit) => {
                        queued.key = None;
                        return permit;
                    }
                    // Only reachable if the sender vanished without a send
                    Err(_) => queued = self.enqueue(current),
                },
                changed = priority.changed(), if watching => match changed {
                    Ok(()) => {
                        let next = *priority.borrow_and_update();
                        if next != current {
                            current = next;
                            self.requeue(&mut queued, next);
                        }
                    }
                    Err(_) => watching = false,
                },
            }
        }
    }

    /// Wait for a slot at a fixed priority.
    pub async fn acquire_with_priority(&self, priority: Priority) -> AdmissionPermit {
        let (_, receiver) = watch::channel(priority);
        self.acquire(receiver).await
    }

    /// Take a slot only if one is free and nobody of the same or higher
    /// priority is waiting.
    pub fn try_acquire(&self, priority: Priority) -> Option<AdmissionPermit> {
        let in_flight = {
            let mut state = self.shared.state.lock();
            let queue_ahead = state
                .waiting
                .keys()
                .next()
                .is_some_and(|key| key.priority() >= priority);
            let class_full = priority == Priority::Low && state.active_low >= self.shared.low_limit;
            if queue_ahead || class_full || state.active() >= self.shared.capacity {
                return None;
            }
            state.occupy(priority);
            state.active()
        };
        self.shared.record_admission(1, in_flight);

        Some(AdmissionPermit {
            shared: Some(Arc::clone(&self.shared)),
            class: priority,
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Maximum concurrent low-priority downloads.
    pub fn low_priority_limit(&self) -> usize {
        self.shared.low_limit
    }

    /// Downloads currently admitted.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().active()
    }

    /// Operations waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Highest number of simultaneous admissions seen.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Total admissions granted.
    pub fn admitted(&self) -> u64 {
        self.shared.admitted.load(Ordering::Relaxed)
    }

    fn enqueue(&self, priority: Priority) -> Queued {
        let (sender, receiver) = oneshot::channel();
        let key = self.shared.state.lock().enqueue(priority, sender);
        trace!(priority = %priority, sequence = key.sequence, "Queued for download slot");
        dispatch(&self.shared);

        Queued {
            shared: Arc::clone(&self.shared),
            key: Some(key),
            receiver,
        }
    }

    /// Move a waiter to its new priority class, keeping its arrival order.
    fn requeue(&self, queued: &mut Queued, priority: Priority) {
        let Some(old) = queued.key else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            // Already granted: the permit is in the channel
            let Some(waiter) = state.waiting.remove(&old) else {
                return;
            };
            let key = QueueKey {
                rank: Reverse(priority),
                sequence: old.sequence,
            };
            state.waiting.insert(key, waiter);
            queued.key = Some(key);
        }
        trace!(priority = %priority, sequence = old.sequence, "Requeued for download slot");

        dispatch(&self.shared);
    }
}

impl fmt::Debug for DownloadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DownloadScheduler")
            .field("capacity", &self.shared.capacity)
            .field("low_limit", &self.shared.low_limit)
            .field("active_normal", &state.active_normal)
            .field("active_low", &state.active_low)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

/// A waiter's place in the queue. Leaves the queue when dropped.
struct Queued {
    shared: Arc<Shared>,
    key: Option<QueueKey>,
    receiver: oneshot::Receiver<AdmissionPermit>,
}

impl Drop for Queued {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // If the key is gone the permit was already sent; dropping the
            // receiver drops the permit, which frees the slot.
            self.shared.state.lock().waiting.remove(&key);
        }
    }
}

// =============================================================================
// Permit
// =============================================================================

/// A download slot. Dropping it admits the next waiter.
pub struct AdmissionPermit {
    shared: Option<Arc<Shared>>,
    class: Priority,
}

impl AdmissionPermit {
    /// Priority class the slot was granted under.
    pub fn class(&self) -> Priority {
        self.class
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.state.lock().vacate(self.class);
            dispatch(&shared);
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("class", &self.class)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    const SETTLE: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_capacity_limits_in_flight() {
        let scheduler = DownloadScheduler::new(2, LowPriorityAdmission::WhenIdle);
        assert_eq!(scheduler.low_priority_limit(), 2);

        let first = scheduler.try_acquire(Priority::Normal).unwrap();
        let _second = scheduler.try_acquire(Priority::Normal).unwrap();
        assert!(scheduler.try_acquire(Priority::Normal).is_none());
        assert_eq!(scheduler.in_flight(), 2);

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire_with_priority(Priority::Normal).await })
        };
        sleep(SETTLE).await;
        assert!(!waiter.is_finished());
        assert_eq!(scheduler.waiting(), 1);

        drop(first);
        let third = timeout(WAIT, waiter).await.unwrap().unwrap();
        assert_eq!(third.class(), Priority::Normal);
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(scheduler.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_normal_admitted_before_low() {
        let scheduler = DownloadScheduler::new(1, LowPriorityAdmission::WhenIdle);
        let blocker = scheduler.try_acquire(Priority::Normal).unwrap();
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        for (label, priority) in [("low", Priority::Low), ("normal", Priority::Normal)] {
            let scheduler = scheduler.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let permit = scheduler.acquire_with_priority(priority).await;
                order_tx.send(label).unwrap();
                drop(permit);
            });
            // Low queues strictly earlier than normal
            sleep(SETTLE).await;
        }

        drop(blocker);
        let first = timeout(WAIT, order_rx.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, order_rx.recv()).await.unwrap().unwrap();
        assert_eq!((first, second), ("normal", "low"));
    }

    #[test]
    fn test_low_priority_cap_never_exceeds_capacity() {
        let scheduler = DownloadScheduler::new(2, LowPriorityAdmission::Capped(5));
        assert_eq!(scheduler.capacity(), 2);
        assert_eq!(scheduler.low_priority_limit(), 2);
    }

    #[tokio::test]
    async fn test_capped_low_priority() {
        let scheduler = DownloadScheduler::new(4, LowPriorityAdmission::Capped(1));
        assert_eq!(scheduler.low_priority_limit(), 1);

        let _low = scheduler.try_acquire(Priority::Low).unwrap();
        assert!(scheduler.try_acquire(Priority::Low).is_none());
        assert!(scheduler
            .acquire_with_priority(Priority::Low)
            .now_or_never()
            .is_none());

        // Normal work still has the remaining slots
        let _normal = scheduler.try_acquire(Priority::Normal).unwrap();
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(scheduler.waiting(), 0);
    }

    #[tokio::test]
    async fn test_escalation_moves_waiter_ahead() {
        let scheduler = DownloadScheduler::new(1, LowPriorityAdmission::WhenIdle);
        let blocker = scheduler.try_acquire(Priority::Normal).unwrap();
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let (escalate_tx, escalate_rx) = watch::channel(Priority::Low);

        {
            let scheduler = scheduler.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let permit = scheduler.acquire_with_priority(Priority::Low).await;
                order_tx.send("older").unwrap();
                drop(permit);
            });
        }
        sleep(SETTLE).await;
        {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let permit = scheduler.acquire(escalate_rx).await;
                order_tx.send("escalated").unwrap();
                drop(permit);
            });
        }
        sleep(SETTLE).await;

        escalate_tx.send(Priority::Normal).unwrap();
        sleep(SETTLE).await;
        drop(blocker);

        let first = timeout(WAIT, order_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, "escalated");
    }

    #[tokio::test]
    async fn test_escalation_lifts_low_cap() {
        let scheduler = DownloadScheduler::new(2, LowPriorityAdmission::Capped(1));
        let _low = scheduler.try_acquire(Priority::Low).unwrap();
        let (escalate_tx, escalate_rx) = watch::channel(Priority::Low);

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(escalate_rx).await })
        };
        sleep(SETTLE).await;
        assert!(!waiter.is_finished());

        escalate_tx.send(Priority::Normal).unwrap();
        let permit = timeout(WAIT, waiter).await.unwrap().unwrap();
        assert_eq!(permit.class(), Priority::Normal);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue() {
        let scheduler = DownloadScheduler::new(1, LowPriorityAdmission::WhenIdle);
        let blocker = scheduler.try_acquire(Priority::Normal).unwrap();

        assert!(scheduler
            .acquire_with_priority(Priority::Normal)
            .now_or_never()
            .is_none());
        assert_eq!(scheduler.waiting(), 0);

        drop(blocker);
        assert_eq!(scheduler.in_flight(), 0);
        assert!(scheduler.try_acquire(Priority::Low).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_task_does_not_leak_slot() {
        let scheduler = DownloadScheduler::new(1, LowPriorityAdmission::WhenIdle);
        let blocker = scheduler.try_acquire(Priority::Normal).unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _permit = scheduler.acquire_with_priority(Priority::Normal).await;
                std::future::pending::<()>().await;
            })
        };
        sleep(SETTLE).await;
        drop(blocker);
        sleep(SETTLE).await;
        assert_eq!(scheduler.in_flight(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(scheduler.in_flight(), 0);
    }
}
