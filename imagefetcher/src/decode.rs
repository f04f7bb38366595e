//! Decode and downsample adapter.
//!
//! Decoding is CPU-bound and synchronous; the controller runs it on Tokio's
//! blocking pool.

use std::sync::Arc;

use image::imageops::FilterType;
use tracing::trace;

use crate::error::DecodeError;
use crate::result::Bitmap;
use crate::size::PixelDimensions;

/// Turns encoded bytes into a bitmap no larger than needed for `target`.
pub trait ImageDecoder: Send + Sync + 'static {
    /// Decode `bytes`. With a target, the result covers the target box with
    /// its aspect ratio preserved and is never upscaled.
    fn decode(&self, bytes: &[u8], target: Option<PixelDimensions>) -> Result<Bitmap, DecodeError>;
}

impl<D: ImageDecoder> ImageDecoder for Arc<D> {
    fn decode(&self, bytes: &[u8], target: Option<PixelDimensions>) -> Result<Bitmap, DecodeError> {
        (**self).decode(bytes, target)
    }
}

/// Decoder built on the `image` crate.
///
/// Supports PNG, JPEG, GIF (first frame), WebP and BMP.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateDecoder {
    filter: FilterType,
}

impl ImageCrateDecoder {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> FilterType {
        self.filter
    }
}

impl Default for ImageCrateDecoder {
    /// Triangle (bilinear) filtering: good quality for thumbnails at a
    /// fraction of Lanczos' cost.
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8], target: Option<PixelDimensions>) -> Result<Bitmap, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::new("empty image data"));
        }

        let image = image::load_from_memory(bytes).map_err(|e| DecodeError::new(e.to_string()))?;
        let actual = PixelDimensions::new(image.width(), image.height());

        let image = match target.map(|target| target.fill_within(actual)) {
            Some(scaled) if scaled != actual => {
                trace!(from = %actual, to = %scaled, "Downsampling decoded image");
                image.resize_exact(scaled.width, scaled.height, self.filter)
            }
            _ => image,
        };

        Ok(Bitmap::new(image.into_rgba8()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_decode_original_size() {
        let bitmap = ImageCrateDecoder::default().decode(&png(40, 20), None).unwrap();
        assert_eq!(bitmap.dimensions(), PixelDimensions::new(40, 20));
    }

    #[test]
    fn test_decode_downsamples_to_fill_target() {
        let bitmap = ImageCrateDecoder::default()
            .decode(&png(400, 200), Some(PixelDimensions::new(100, 100)))
            .unwrap();
        assert_eq!(bitmap.dimensions(), PixelDimensions::new(200, 100));
    }

    #[test]
    fn test_decode_never_upscales() {
        let bitmap = ImageCrateDecoder::new(FilterType::Nearest)
            .decode(&png(30, 30), Some(PixelDimensions::new(300, 300)))
            .unwrap();
        assert_eq!(bitmap.dimensions(), PixelDimensions::new(30, 30));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let decoder = ImageCrateDecoder::default();
        assert!(decoder.decode(b"definitely not an image", None).is_err());
        assert_eq!(
            decoder.decode(&[], None).unwrap_err(),
            DecodeError::new("empty image data")
        );
    }
}
