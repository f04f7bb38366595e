//! Single-await form of `fetch_image`.
//!
//! Each call mints its own observer token, so concurrent awaits of the same
//! image coalesce exactly like callback observers. Dropping the future
//! detaches the token, which cancels the operation if it was the last one.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::ImageFetchController;
use crate::decode::ImageDecoder;
use crate::error::FetchError;
use crate::request::{ObserverToken, Request};
use crate::result::FetchResult;
use crate::transport::Transport;

/// Detaches the observer when the awaiting future goes away early.
struct ObserverGuard<'a, T: Transport, D: ImageDecoder> {
    controller: &'a ImageFetchController<T, D>,
    request: &'a Request,
    token: ObserverToken,
    armed: bool,
}

impl<T: Transport, D: ImageDecoder> Drop for ObserverGuard<'_, T, D> {
    fn drop(&mut self) {
        if self.armed {
            self.controller
                .remove_request_observer(self.request, self.token);
        }
    }
}

impl<T: Transport, D: ImageDecoder> ImageFetchController<T, D> {
    /// Fetch an image and await the result.
    ///
    /// Dropping the returned future before it resolves removes this
    /// caller as an observer.
    pub async fn fetch(&self, request: Request) -> FetchResult {
        let token = ObserverToken::mint();
        let (tx, rx) = oneshot::channel();

        let mut guard = ObserverGuard {
            controller: self,
            request: &request,
            token,
            armed: true,
        };

        self.fetch_image(request.clone(), token, move |result| {
            let _ = tx.send(result);
        });

        let received = rx.await;
        guard.armed = false;

        match received {
            Ok(result) => result,
            Err(_) => FetchResult::Error {
                error: FetchError::Cancelled,
                request: request.clone(),
            },
        }
    }

    /// Like [`fetch`](Self::fetch), resolving to a cancelled error as soon as
    /// `cancel` fires.
    pub async fn fetch_with_cancellation(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let fallback = request.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => FetchResult::Error {
                error: FetchError::Cancelled,
                request: fallback,
            },
            result = self.fetch(request) => result,
        }
    }
}
