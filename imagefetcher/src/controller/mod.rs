//! Image fetch controller.
//!
//! The façade views talk to. It owns the memory cache, the operation
//! registry and the download scheduler, and runs operations on a Tokio
//! runtime.
//!
//! # Request Flow
//!
//! ```text
//! fetch_image(request, token, callback)
//!     │
//!     ├─► fingerprint ──► MemoryCache hit ──► callback(MemoryCache)     [caller's thread]
//!     │
//!     └─► miss ──► registry.attach ──► Started ──► spawn operation task
//!                                  └─► Joined  ──► wait for the running task
//!
//! operation task:
//!     admission permit ─► transport.download ─► spawn_blocking(decode)
//!         ─► MemoryCache.put ─► registry.complete ─► every callback      [Tokio worker]
//! ```
//!
//! # Delivery context
//!
//! Memory cache hits invoke the callback on the calling thread before
//! `fetch_image` returns. Every other result is delivered on the Tokio
//! worker thread running the operation. Callbacks must not block; hand the
//! result to the UI thread (or a channel) and return.

mod bridge;
mod operation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::cache::{MemoryCache, MemoryCacheStats};
use crate::config::FetcherConfig;
use crate::decode::ImageDecoder;
use crate::error::FetcherError;
use crate::registry::{Delivery, DetachOutcome, OperationRegistry, RegistryStats};
use crate::request::{ObserverToken, Request};
use crate::result::{FetchResult, FulfillmentType, PerformanceMetrics};
use crate::scheduler::DownloadScheduler;
use crate::transport::Transport;

/// Coalescing, cancellable image fetch controller.
///
/// Construct one per cache domain and share it by cloning; clones share the
/// same cache, registry and download slots.
pub struct ImageFetchController<T, D> {
    inner: Arc<Inner<T, D>>,
}

impl<T, D> Clone for ImageFetchController<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, D> {
    config: FetcherConfig,
    transport: T,
    decoder: Arc<D>,
    registry: OperationRegistry,
    memory_cache: MemoryCache,
    scheduler: DownloadScheduler,
    runtime: Handle,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    memory_hits: AtomicU64,
    downloads: AtomicU64,
    disk_hits: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of controller activity.
#[derive(Debug, Clone, Default)]
pub struct ControllerStats {
    /// `fetch_image` calls
    pub requests: u64,
    /// Requests answered from the memory cache
    pub memory_hits: u64,
    /// Operations whose bytes came from the network
    pub downloads: u64,
    /// Operations whose bytes came from a local byte cache
    pub disk_hits: u64,
    /// Operations that ended in a transport or decode error
    pub failures: u64,
    /// Downloads currently holding a slot
    pub downloads_in_flight: usize,
    /// Highest simultaneous downloads seen
    pub peak_downloads: usize,
    pub registry: RegistryStats,
    pub memory_cache: MemoryCacheStats,
}

impl<T: Transport, D: ImageDecoder> ImageFetchController<T, D> {
    /// Create a controller that runs operations on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or no runtime is entered.
    pub fn new(config: FetcherConfig, transport: T, decoder: D) -> Result<Self, FetcherError> {
        let runtime = Handle::try_current()?;
        Self::with_runtime(config, transport, decoder, runtime)
    }

    /// Create a controller that runs operations on `runtime`.
    ///
    /// Use this when `fetch_image` is called from threads outside any runtime.
    pub fn with_runtime(
        config: FetcherConfig,
        transport: T,
        decoder: D,
        runtime: Handle,
    ) -> Result<Self, FetcherError> {
        config.validate()?;

        info!(
            transport = transport.name(),
            max_concurrent_downloads = config.max_concurrent_downloads,
            memory_cache = %crate::config::format_size(config.memory_cache_bytes as usize),
            low_priority = %config.low_priority,
            "Image fetch controller created"
        );

        let inner = Inner {
            memory_cache: MemoryCache::new(config.memory_cache_bytes),
            scheduler: DownloadScheduler::new(config.max_concurrent_downloads, config.low_priority),
            registry: OperationRegistry::new(),
            decoder: Arc::new(decoder),
            transport,
            runtime,
            config,
            counters: Counters::default(),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Fetch an image for the observer `token`.
    ///
    /// The callback is invoked at most once, with the request it answers.
    /// See the module docs for the thread it runs on. Calling again with the
    /// same token replaces the token's previous request.
    pub fn fetch_image<F>(&self, request: Request, token: ObserverToken, callback: F)
    where
        F: FnOnce(FetchResult) + Send + 'static,
    {
        let started = Instant::now();
        let inner = &self.inner;
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        let fingerprint = request.fingerprint();

        if let Some(image) = inner.memory_cache.get(&fingerprint) {
            // The token may still be attached to an older request
            inner.registry.detach_token(token);
            inner.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                fingerprint = %fingerprint,
                identifier = request.identifier(),
                token = %token,
                "Memory cache hit"
            );
            callback(FetchResult::Success {
                image,
                request,
                metrics: PerformanceMetrics {
                    fulfillment_type: FulfillmentType::MemoryCache,
                    elapsed: started.elapsed(),
                    coalesced: false,
                },
            });
            return;
        }

        debug!(
            fingerprint = %fingerprint,
            identifier = request.identifier(),
            token = %token,
            priority = %request.priority(),
            "Memory cache miss"
        );

        let priority = request.priority();
        let deliver = Box::new(move |delivery: Delivery| {
            let result = match delivery.outcome {
                Ok(fetched) => FetchResult::Success {
                    image: fetched.image,
                    request,
                    metrics: PerformanceMetrics {
                        fulfillment_type: fetched.fulfillment,
                        elapsed: started.elapsed(),
                        coalesced: delivery.coalesced,
                    },
                },
                Err(error) => FetchResult::Error { error, request },
            };
            callback(result);
        });

        let task_inner = Arc::clone(inner);
        inner
            .registry
            .attach(fingerprint, token, priority, deliver, move |handle| {
                let runtime = task_inner.runtime.clone();
                let guard = operation::CompletionGuard::new(task_inner, handle);
                runtime.spawn(operation::run_operation(guard));
            });
    }

    /// Stop observing `request` with `token`.
    ///
    /// When `token` was the last observer, the underlying download and decode
    /// are cancelled. Once this returns the token's callback will not run.
    /// Safe to call repeatedly or for a token that never attached.
    ///
    /// If the token's callback is running on another thread at that moment,
    /// this blocks until that callback returns, so the wait is bounded by
    /// the callback's own run time. Called from inside the callback itself
    /// it returns at once.
    pub fn remove_request_observer(&self, request: &Request, token: ObserverToken) -> DetachOutcome {
        let fingerprint = request.fingerprint();
        let outcome = self.inner.registry.detach(&fingerprint, token);
        debug!(
            fingerprint = %fingerprint,
            token = %token,
            outcome = ?outcome,
            "Observer removed"
        );
        outcome
    }

    /// Number of operations currently registered.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// True if a pending operation exists for the request.
    pub fn is_in_flight(&self, request: &Request) -> bool {
        self.inner.registry.contains(&request.fingerprint())
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.inner.memory_cache
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn stats(&self) -> ControllerStats {
        let counters = &self.inner.counters;
        ControllerStats {
            requests: counters.requests.load(Ordering::Relaxed),
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            downloads: counters.downloads.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            downloads_in_flight: self.inner.scheduler.in_flight(),
            peak_downloads: self.inner.scheduler.peak_in_flight(),
            registry: self.inner.registry.stats(),
            memory_cache: self.inner.memory_cache.stats(),
        }
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            requests = stats.requests,
            memory_hits = stats.memory_hits,
            downloads = stats.downloads,
            disk_hits = stats.disk_hits,
            failures = stats.failures,
            peak_downloads = stats.peak_downloads,
            cache_entries = stats.memory_cache.entry_count,
            cache_bytes = stats.memory_cache.weighted_size,
            "Image fetch controller statistics"
        );
        self.inner.registry.log_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeError, FetchError, TransportError};
    use crate::result::Bitmap;
    use crate::size::PixelDimensions;
    use crate::transport::Downloaded;
    use image::RgbaImage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Transport returning the URL as bytes and counting calls.
    #[derive(Default)]
    struct EchoTransport {
        calls: AtomicUsize,
    }

    impl Transport for EchoTransport {
        async fn download(&self, url: &str) -> Result<Downloaded, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Downloaded::fetched(url.as_bytes().to_vec()))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    /// Decoder producing a blank bitmap at the target size.
    struct BlankDecoder;

    impl ImageDecoder for BlankDecoder {
        fn decode(
            &self,
            bytes: &[u8],
            target: Option<PixelDimensions>,
        ) -> Result<Bitmap, DecodeError> {
            if bytes.is_empty() {
                return Err(DecodeError::new("empty"));
            }
            let size = target.unwrap_or(PixelDimensions::new(8, 8));
            Ok(Bitmap::new(RgbaImage::new(size.width, size.height)))
        }
    }

    fn controller() -> ImageFetchController<EchoTransport, BlankDecoder> {
        ImageFetchController::new(FetcherConfig::default(), EchoTransport::default(), BlankDecoder)
            .unwrap()
    }

    async fn fetch_once(
        controller: &ImageFetchController<EchoTransport, BlankDecoder>,
        request: Request,
    ) -> FetchResult {
        let (tx, rx) = oneshot::channel();
        controller.fetch_image(request, ObserverToken::mint(), move |result| {
            let _ = tx.send(result);
        });
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = ImageFetchController::new(
            FetcherConfig::default(),
            EchoTransport::default(),
            BlankDecoder,
        );
        assert!(matches!(result, Err(FetcherError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = ImageFetchController::new(
            FetcherConfig::default().with_max_concurrent_downloads(0),
            EchoTransport::default(),
            BlankDecoder,
        );
        assert!(matches!(result, Err(FetcherError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_download_then_memory_hit() {
        let controller = controller();
        let request = Request::new("img.png", "cell");

        let first = fetch_once(&controller, request.clone()).await;
        assert_eq!(first.fulfillment_type(), Some(FulfillmentType::Downloaded));

        let second = fetch_once(&controller, request).await;
        assert_eq!(second.fulfillment_type(), Some(FulfillmentType::MemoryCache));
        assert!(first.image().unwrap().ptr_eq(second.image().unwrap()));

        assert_eq!(controller.transport().calls.load(Ordering::SeqCst), 1);
        let stats = controller.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.downloads, 1);
    }

    #[tokio::test]
    async fn test_memory_hit_is_delivered_synchronously() {
        let controller = controller();
        let request = Request::new("img.png", "cell");
        fetch_once(&controller, request.clone()).await;

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        controller.fetch_image(request, ObserverToken::mint(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_reported_with_request() {
        let controller = controller();
        let request = Request::new("", "empty-url");

        let result = fetch_once(&controller, request).await;
        assert_eq!(result.request().identifier(), "empty-url");
        assert!(matches!(
            result.error(),
            Some(crate::error::FetchError::Decode(_))
        ));
        assert_eq!(controller.stats().failures, 1);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_observer_is_noop() {
        let controller = controller();
        let request = Request::new("img.png", "cell");
        assert_eq!(
            controller.remove_request_observer(&request, ObserverToken::mint()),
            DetachOutcome::NotAttached
        );
    }

    #[tokio::test]
    async fn test_remove_observer_inside_own_callback_returns() {
        // GIVEN a callback that removes its own observer while running
        let controller = controller();
        let request = Request::new("img.png", "cell");
        let token = ObserverToken::mint();
        let (tx, rx) = oneshot::channel();
        let inner_controller = controller.clone();
        let inner_request = request.clone();
        controller.fetch_image(request, token, move |result| {
            let outcome = inner_controller.remove_request_observer(&inner_request, token);
            let _ = tx.send((result.is_success(), outcome));
        });

        // WHEN the result arrives
        let (success, outcome) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        // THEN the removal returned without waiting on itself
        assert!(success);
        assert_ne!(outcome, DetachOutcome::Cancelled);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn test_with_runtime_from_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let controller = ImageFetchController::with_runtime(
            FetcherConfig::default(),
            EchoTransport::default(),
            BlankDecoder,
            runtime.handle().clone(),
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        controller.fetch_image(Request::new("img.png", "cell"), ObserverToken::mint(), move |result| {
            let _ = tx.send(result.is_success());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_shut_down_runtime_completes_operation() {
        // GIVEN a controller whose runtime has already shut down
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let controller = ImageFetchController::with_runtime(
            FetcherConfig::default(),
            EchoTransport::default(),
            BlankDecoder,
            runtime.handle().clone(),
        )
        .unwrap();
        drop(runtime);

        // WHEN an image is requested
        let (tx, rx) = std::sync::mpsc::channel();
        let first_tx = tx.clone();
        controller.fetch_image(Request::new("img.png", "a"), ObserverToken::mint(), move |result| {
            let _ = first_tx.send(result);
        });

        // THEN the observer hears a cancellation and nothing stays in flight
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.error().is_some_and(FetchError::is_cancelled));
        assert_eq!(controller.in_flight_count(), 0);
        assert!(!controller.is_in_flight(&Request::new("img.png", "a")));

        // AND a repeat request starts fresh instead of joining a dead operation
        controller.fetch_image(Request::new("img.png", "b"), ObserverToken::mint(), move |result| {
            let _ = tx.send(result);
        });
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.request().identifier(), "b");
        assert!(result.error().is_some_and(FetchError::is_cancelled));
        assert_eq!(controller.stats().registry.joins, 0);
    }
}
