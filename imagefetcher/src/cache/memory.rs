//! In-memory bitmap cache with LRU eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;
use crate::result::Bitmap;

/// Bounded, thread-safe cache of decoded bitmaps.
///
/// Capacity is measured in decoded bytes (`width * height * 4`), not entries,
/// so one large original-size image counts as many thumbnails. Entries are
/// write-once: a second `put` for the same fingerprint keeps the first bitmap.
pub struct MemoryCache {
    cache: Cache<Fingerprint, Bitmap>,
    capacity_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    duplicate_puts: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl MemoryCache {
    /// Create a memory cache holding at most `capacity_bytes` of pixels.
    pub fn new(capacity_bytes: u64) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let eviction_counter = Arc::clone(&evictions);

        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_key: &Fingerprint, bitmap: &Bitmap| -> u32 {
                u32::try_from(bitmap.byte_len()).unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<Fingerprint>, _bitmap, cause: RemovalCause| {
                if cause.was_evicted() {
                    eviction_counter.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %key, ?cause, "Memory cache evicted bitmap");
                }
            })
            .build();

        info!(
            capacity = %crate::config::format_size(capacity_bytes as usize),
            "Memory cache created"
        );

        Self {
            cache,
            capacity_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            duplicate_puts: AtomicU64::new(0),
            evictions,
        }
    }

    /// Look up a bitmap, refreshing its recency on hit.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Bitmap> {
        match self.cache.get(fingerprint) {
            Some(bitmap) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bitmap)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a bitmap unless one is already cached for this fingerprint.
    ///
    /// Returns `true` if the bitmap was inserted.
    pub fn put(&self, fingerprint: Fingerprint, bitmap: Bitmap) -> bool {
        let entry = self.cache.entry(fingerprint).or_insert(bitmap);
        if entry.is_fresh() {
            self.inserts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.duplicate_puts.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Check for an entry without touching recency or hit statistics.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.contains_key(fingerprint)
    }

    /// Approximate number of cached bitmaps.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Approximate total decoded bytes held.
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Apply pending evictions and bookkeeping now.
    ///
    /// Moka amortizes maintenance across operations; counts are only exact
    /// after this runs.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            duplicate_puts: self.duplicate_puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
            weighted_size: self.cache.weighted_size(),
            capacity_bytes: self.capacity_bytes,
        }
    }
}

/// Snapshot of memory cache counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub duplicate_puts: u64,
    pub evictions: u64,
    pub entry_count: u64,
    pub weighted_size: u64,
    pub capacity_bytes: u64,
}

impl MemoryCacheStats {
    /// Fraction of lookups served from memory (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}
