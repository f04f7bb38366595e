//! Byte transports.
//!
//! A transport turns a URL into bytes. Cancellation is expressed by dropping
//! the returned future: implementations must stop their network or file I/O
//! when that happens, which `reqwest` and `tokio::fs` futures do.
//!
//! - [`HttpTransport`]: async `reqwest` client
//! - [`DiskCachedTransport`]: decorator persisting downloaded bytes and
//!   reporting later reads as already cached

mod disk;
mod http;

pub use disk::{DiskCacheStats, DiskCachedTransport};
pub use http::{HttpTransport, DEFAULT_TIMEOUT};

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;

/// Bytes returned by a transport.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Bytes,
    /// The bytes were served from local storage rather than the network.
    pub was_already_cached: bool,
}

impl Downloaded {
    /// Bytes fetched from the network.
    pub fn fetched(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            was_already_cached: false,
        }
    }

    /// Bytes read from a local cache.
    pub fn cached(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            was_already_cached: true,
        }
    }
}

/// Source of image bytes.
///
/// Implementations must be cheap to share across tasks.
pub trait Transport: Send + Sync + 'static {
    /// Download the bytes at `url`.
    fn download(&self, url: &str) -> impl Future<Output = Result<Downloaded, TransportError>> + Send;

    /// Short name for logging.
    fn name(&self) -> &str;
}

impl<T: Transport> Transport for Arc<T> {
    fn download(&self, url: &str) -> impl Future<Output = Result<Downloaded, TransportError>> + Send {
        (**self).download(url)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
