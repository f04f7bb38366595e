//! Fetch requests and observer tokens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fingerprint::Fingerprint;
use crate::size::SizeMetrics;

/// Request priority.
///
/// Ordered so that `Normal > Low`. An operation's effective priority is the
/// maximum over its attached requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Speculative work, e.g. prefetching rows just outside the viewport.
    Low,
    /// Work for something currently on screen.
    #[default]
    Normal,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

/// An immutable image request.
///
/// The `identifier` travels with the request back to the caller and into
/// log output. It is not part of the deduplication key.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    url: Arc<str>,
    identifier: Arc<str>,
    priority: Priority,
    size_metrics: Option<SizeMetrics>,
}

impl Request {
    /// Creates a normal-priority, original-size request.
    pub fn new(url: impl Into<Arc<str>>, identifier: impl Into<Arc<str>>) -> Self {
        Self {
            url: url.into(),
            identifier: identifier.into(),
            priority: Priority::Normal,
            size_metrics: None,
        }
    }

    /// Sets the request priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Shorthand for `with_priority(Priority::Low)`.
    pub fn low_priority(self) -> Self {
        self.with_priority(Priority::Low)
    }

    /// Sets the resize target. `None` requests the original size.
    pub fn with_size_metrics(mut self, size_metrics: Option<SizeMetrics>) -> Self {
        self.size_metrics = size_metrics;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn size_metrics(&self) -> Option<&SizeMetrics> {
        self.size_metrics.as_ref()
    }

    /// Deduplication and cache key for this request.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(Arc::clone(&self.url), self.size_metrics.as_ref())
    }
}

static NEXT_OBSERVER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one logical subscriber.
///
/// Mint one per view instance (or per awaited call) and pass the same token
/// to both `fetch_image` and `remove_request_observer`. A token carries no
/// ownership over the work it observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverToken(u64);

impl ObserverToken {
    /// Mints a token that is unique within this process.
    pub fn mint() -> Self {
        Self(NEXT_OBSERVER_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}
