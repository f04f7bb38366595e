//! Deduplication and cache key.
//!
//! Two requests share in-flight work and memory cache entries exactly when
//! their fingerprints are equal. The key is the URL plus the pixel target
//! rounded to whole pixels, so sub-pixel layout jitter does not split work.

use std::fmt;
use std::sync::Arc;

use crate::size::{PixelDimensions, SizeMetrics};

/// Canonical key for one decoded image variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    url: Arc<str>,
    target: Option<PixelDimensions>,
}

impl Fingerprint {
    /// Computes the fingerprint for a URL and optional resize target.
    ///
    /// Without size metrics the fingerprint is URL-only, which denotes an
    /// original-size fetch.
    pub fn compute(url: impl Into<Arc<str>>, size_metrics: Option<&SizeMetrics>) -> Self {
        Self {
            url: url.into(),
            target: size_metrics.map(SizeMetrics::target_pixels),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whole-pixel decode target, `None` for original size.
    pub fn target(&self) -> Option<PixelDimensions> {
        self.target
    }

    pub fn is_original_size(&self) -> bool {
        self.target.is_none()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(f, "{}@{}", self.url, target),
            None => write!(f, "{}", self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::Size;
    use std::collections::HashSet;

    fn metrics(width: f64, height: f64) -> SizeMetrics {
        SizeMetrics::new(Size::new(width, height), Size::new(1000.0, 1000.0)).unwrap()
    }

    #[test]
    fn test_same_inputs_same_fingerprint() {
        let a = Fingerprint::compute("img.png", Some(&metrics(100.0, 100.0)));
        let b = Fingerprint::compute("img.png", Some(&metrics(100.0, 100.0)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_inputs_distinct_fingerprints() {
        let a_100 = Fingerprint::compute("A", Some(&metrics(100.0, 100.0)));
        let a_200 = Fingerprint::compute("A", Some(&metrics(200.0, 200.0)));
        let b_100 = Fingerprint::compute("B", Some(&metrics(100.0, 100.0)));
        let a_orig = Fingerprint::compute("A", None);

        let set: HashSet<_> = [&a_100, &a_200, &b_100, &a_orig].into_iter().collect();
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_sub_pixel_differences_collapse() {
        let a = Fingerprint::compute("A", Some(&metrics(100.2, 99.8)));
        let b = Fingerprint::compute("A", Some(&metrics(99.9, 100.4)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_source_size_is_not_part_of_key() {
        let small = SizeMetrics::new(Size::new(50.0, 50.0), Size::new(100.0, 100.0));
        let large = SizeMetrics::new(Size::new(50.0, 50.0), Size::new(4000.0, 4000.0));
        assert_eq!(
            Fingerprint::compute("A", small.as_ref()),
            Fingerprint::compute("A", large.as_ref())
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Fingerprint::compute("img.png", Some(&metrics(50.0, 50.0))).to_string(),
            "img.png@50x50"
        );
        let original = Fingerprint::compute("img.png", None);
        assert_eq!(original.to_string(), "img.png");
        assert!(original.is_original_size());
    }
}
