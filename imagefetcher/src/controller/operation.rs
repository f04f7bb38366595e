//! The task behind one coalesced operation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Inner;
use crate::decode::ImageDecoder;
use crate::error::{DecodeError, FetchError};
use crate::registry::{Fetched, OperationHandle, OperationOutcome};
use crate::result::FulfillmentType;
use crate::transport::Transport;

/// Completes the operation as cancelled if the task ends without
/// reporting.
///
/// Built before the task is spawned so it also covers a task that is never
/// polled, as when the runtime has already shut down. Abort and panic drop
/// it the same way.
pub(super) struct CompletionGuard<T, D> {
    inner: Arc<Inner<T, D>>,
    handle: OperationHandle,
    armed: bool,
}

impl<T, D> CompletionGuard<T, D> {
    pub(super) fn new(inner: Arc<Inner<T, D>>, handle: OperationHandle) -> Self {
        Self {
            inner,
            handle,
            armed: true,
        }
    }

    fn complete(mut self, outcome: OperationOutcome) -> usize {
        self.armed = false;
        self.inner.registry.complete(&self.handle, outcome)
    }
}

impl<T, D> Drop for CompletionGuard<T, D> {
    fn drop(&mut self) {
        if self.armed {
            self.inner
                .registry
                .complete(&self.handle, Err(FetchError::Cancelled));
        }
    }
}

pub(super) async fn run_operation<T, D>(guard: CompletionGuard<T, D>)
where
    T: Transport,
    D: ImageDecoder,
{
    let inner = Arc::clone(&guard.inner);
    let handle = guard.handle.clone();
    let fingerprint = handle.fingerprint();

    debug!(
        operation = handle.id(),
        fingerprint = %fingerprint,
        priority = %handle.priority(),
        "Operation started"
    );

    let outcome = tokio::select! {
        biased;
        _ = handle.cancellation().cancelled() => {
            debug!(
                operation = handle.id(),
                fingerprint = %fingerprint,
                age_ms = handle.age().as_millis() as u64,
                "Operation cancelled"
            );
            // Every observer has already detached; nobody is left to notify
            guard.complete(Err(FetchError::Cancelled));
            return;
        }
        outcome = fetch_and_decode(&inner, &handle) => outcome,
    };

    match &outcome {
        Ok(fetched) => {
            match fetched.fulfillment {
                FulfillmentType::DiskCache => {
                    inner.counters.disk_hits.fetch_add(1, Ordering::Relaxed)
                }
                _ => inner.counters.downloads.fetch_add(1, Ordering::Relaxed),
            };
            inner
                .memory_cache
                .put(fingerprint.clone(), fetched.image.clone());
        }
        Err(error) => {
            inner.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation = handle.id(),
                fingerprint = %fingerprint,
                error = %error,
                "Image fetch failed"
            );
        }
    }

    let delivered = guard.complete(outcome);
    debug!(
        operation = handle.id(),
        fingerprint = %fingerprint,
        observers = delivered,
        elapsed_ms = handle.age().as_millis() as u64,
        "Operation completed"
    );
}

async fn fetch_and_decode<T, D>(
    inner: &Inner<T, D>,
    handle: &OperationHandle,
) -> Result<Fetched, FetchError>
where
    T: Transport,
    D: ImageDecoder,
{
    let fingerprint = handle.fingerprint();

    let downloaded = {
        let permit = inner.scheduler.acquire(handle.subscribe_priority()).await;
        debug!(
            operation = handle.id(),
            url = fingerprint.url(),
            class = %permit.class(),
            "Download admitted"
        );
        inner.transport.download(fingerprint.url()).await?
    };

    let fulfillment = if downloaded.was_already_cached {
        FulfillmentType::DiskCache
    } else {
        FulfillmentType::Downloaded
    };

    if handle.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let decoder = Arc::clone(&inner.decoder);
    let target = fingerprint.target();
    let bytes = downloaded.bytes;
    let image = tokio::task::spawn_blocking(move || decoder.decode(&bytes, target))
        .await
        .map_err(|e| DecodeError::new(format!("decode task failed: {e}")))??;

    Ok(Fetched { image, fulfillment })
}
