//! Size metrics and resize targets.
//!
//! A display request knows the logical frame it will be drawn into and the
//! declared size of the source image. The frame is multiplied by the device
//! pixel scale to get the decode target. When either size is degenerate the
//! request falls back to an original-size fetch instead of failing.

use std::fmt;

/// A two-dimensional size in floating point units (points or pixels).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    /// The empty size.
    pub const ZERO: Size = Size {
        width: 0.0,
        height: 0.0,
    };

    /// Creates a new size.
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Returns true when both dimensions are finite and strictly positive.
    pub fn is_positive(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Multiplies both dimensions by `factor`.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// Whole-pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelDimensions {
    pub width: u32,
    pub height: u32,
}

impl PixelDimensions {
    /// Creates new pixel dimensions.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Rounds a pixel-space size to whole pixels, never below 1x1.
    pub fn from_size(size: Size) -> Self {
        Self {
            width: round_dimension(size.width),
            height: round_dimension(size.height),
        }
    }

    /// Total number of pixels.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Dimensions an image of size `actual` should be downsampled to so that
    /// it covers this box with its aspect ratio intact.
    ///
    /// Never upscales: an image already no larger than the box is returned
    /// unchanged.
    pub fn fill_within(&self, actual: PixelDimensions) -> PixelDimensions {
        if actual.width == 0 || actual.height == 0 {
            return actual;
        }

        let scale_x = f64::from(self.width) / f64::from(actual.width);
        let scale_y = f64::from(self.height) / f64::from(actual.height);
        let scale = scale_x.max(scale_y);
        if scale >= 1.0 {
            return actual;
        }

        PixelDimensions {
            width: round_dimension(f64::from(actual.width) * scale),
            height: round_dimension(f64::from(actual.height) * scale),
        }
    }
}

impl fmt::Display for PixelDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn round_dimension(value: f64) -> u32 {
    // `as` saturates, the clamp keeps tiny positive sizes at one pixel
    value.round().clamp(1.0, f64::from(u32::MAX)) as u32
}

/// Scales a logical frame size to the pixel size the image is decoded at.
///
/// Returns `None` for empty, negative or non-finite input, which callers
/// treat as "fetch at original size".
pub fn scale_target(frame: Size, scale_factor: f64) -> Option<Size> {
    if !frame.is_positive() || !scale_factor.is_finite() || scale_factor <= 0.0 {
        return None;
    }
    Some(frame.scaled(scale_factor))
}

/// Target and source sizes for a resized fetch.
///
/// Only exists when both sizes are strictly positive in both dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeMetrics {
    target: Size,
    source: Size,
}

impl SizeMetrics {
    /// Creates size metrics from a pixel target and the declared source size.
    ///
    /// Returns `None` if either size is not strictly positive.
    pub fn new(target: Size, source: Size) -> Option<Self> {
        if target.is_positive() && source.is_positive() {
            Some(Self { target, source })
        } else {
            None
        }
    }

    /// Builds size metrics for an image drawn into `frame` on a display with
    /// the given pixel scale.
    pub fn for_frame(frame: Size, scale_factor: f64, source: Size) -> Option<Self> {
        scale_target(frame, scale_factor).and_then(|target| Self::new(target, source))
    }

    /// Target size in pixels.
    pub fn target(&self) -> Size {
        self.target
    }

    /// Declared source size.
    pub fn source(&self) -> Size {
        self.source
    }

    /// The target rounded to whole pixels. Used for decoding and as part of
    /// the fingerprint.
    pub fn target_pixels(&self) -> PixelDimensions {
        PixelDimensions::from_size(self.target)
    }
}
