//! imagefetcher - coalescing, cancellable image fetching for display surfaces
//!
//! This library serves decoded, display-sized images to many concurrent
//! observers (views appearing and disappearing during scroll) while doing as
//! little network and decode work as possible.
//!
//! # High-Level API
//!
//! The [`controller`] module provides the façade:
//!
//! ```ignore
//! use imagefetcher::config::FetcherConfig;
//! use imagefetcher::controller::ImageFetchController;
//! use imagefetcher::decode::ImageCrateDecoder;
//! use imagefetcher::request::{ObserverToken, Request};
//! use imagefetcher::transport::HttpTransport;
//!
//! let controller = ImageFetchController::new(
//!     FetcherConfig::default(),
//!     HttpTransport::new()?,
//!     ImageCrateDecoder::default(),
//! )?;
//!
//! // Callback form: one token per view, detach when the view goes away
//! let token = ObserverToken::mint();
//! let request = Request::new("https://example.com/a.png", "cell-12");
//! controller.fetch_image(request.clone(), token, |result| { /* render */ });
//! controller.remove_request_observer(&request, token);
//!
//! // Single-await form
//! let result = controller.fetch(request).await;
//! ```

pub mod cache;
pub mod config;
pub mod controller;
pub mod decode;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod registry;
pub mod request;
pub mod result;
pub mod scheduler;
pub mod size;
pub mod transport;

pub use controller::ImageFetchController;
pub use error::{DecodeError, FetchError, FetcherError, TransportError};
pub use fingerprint::Fingerprint;
pub use request::{ObserverToken, Priority, Request};
pub use result::{Bitmap, FetchResult, FulfillmentType, PerformanceMetrics};
pub use size::{PixelDimensions, Size, SizeMetrics};

/// Version of the imagefetcher library and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
