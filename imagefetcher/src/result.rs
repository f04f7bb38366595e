//! Fetch results and performance metrics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;

use crate::error::FetchError;
use crate::request::Request;
use crate::size::PixelDimensions;

/// A decoded bitmap shared between the memory cache and every observer.
///
/// Cloning is cheap: all clones point at the same pixel buffer.
#[derive(Clone)]
pub struct Bitmap(Arc<RgbaImage>);

impl Bitmap {
    pub fn new(image: RgbaImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn dimensions(&self) -> PixelDimensions {
        PixelDimensions::new(self.0.width(), self.0.height())
    }

    /// Size of the decoded pixel buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.0.as_raw().len()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.0
    }

    /// True when both bitmaps share the same pixel buffer.
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(image: RgbaImage) -> Self {
        Self::new(image)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bytes", &self.byte_len())
            .finish()
    }
}

/// Where a result's pixels came from.
///
/// Presentation code typically animates `Downloaded` results in and shows
/// cache hits immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FulfillmentType {
    MemoryCache,
    DiskCache,
    Downloaded,
}

impl fmt::Display for FulfillmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillmentType::MemoryCache => write!(f, "memory"),
            FulfillmentType::DiskCache => write!(f, "disk"),
            FulfillmentType::Downloaded => write!(f, "downloaded"),
        }
    }
}

/// Timing and provenance attached to a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceMetrics {
    pub fulfillment_type: FulfillmentType,
    /// Time from `fetch_image` to delivery for this observer.
    pub elapsed: Duration,
    /// True when this observer joined an operation another observer started.
    pub coalesced: bool,
}

/// Outcome delivered to a fetch callback.
#[derive(Debug, Clone)]
pub enum FetchResult {
    Success {
        image: Bitmap,
        request: Request,
        metrics: PerformanceMetrics,
    },
    Error {
        error: FetchError,
        request: Request,
    },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success { .. })
    }

    /// The request this result answers.
    pub fn request(&self) -> &Request {
        match self {
            FetchResult::Success { request, .. } | FetchResult::Error { request, .. } => request,
        }
    }

    pub fn image(&self) -> Option<&Bitmap> {
        match self {
            FetchResult::Success { image, .. } => Some(image),
            FetchResult::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchResult::Success { .. } => None,
            FetchResult::Error { error, .. } => Some(error),
        }
    }

    pub fn metrics(&self) -> Option<&PerformanceMetrics> {
        match self {
            FetchResult::Success { metrics, .. } => Some(metrics),
            FetchResult::Error { .. } => None,
        }
    }

    pub fn fulfillment_type(&self) -> Option<FulfillmentType> {
        self.metrics().map(|m| m.fulfillment_type)
    }

    /// Converts into a plain `Result`, dropping the request.
    pub fn into_result(self) -> Result<(Bitmap, PerformanceMetrics), FetchError> {
        match self {
            FetchResult::Success { image, metrics, .. } => Ok((image, metrics)),
            FetchResult::Error { error, .. } => Err(error),
        }
    }
}
