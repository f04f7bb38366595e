//! Decoded-image caching.
//!
//! The memory cache holds decoded bitmaps keyed by [`Fingerprint`](crate::fingerprint::Fingerprint).
//! It is purely an optimization: a miss (including a miss after eviction)
//! falls through to the operation registry. Persistent byte caching lives
//! on the transport side, see [`crate::transport::DiskCachedTransport`].

mod memory;

pub use memory::{MemoryCache, MemoryCacheStats};
