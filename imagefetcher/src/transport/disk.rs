//! Disk-backed byte cache in front of another transport.
//!
//! # File Layout
//!
//! ```text
//! {cache_dir}/{url_hash}.cache
//! ```
//!
//! The URL is hashed to create a safe filename on every platform. Writes go
//! to a unique temp file first and are renamed into place, so a reader never
//! sees a partial file.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::{Downloaded, Transport};
use crate::error::TransportError;

/// Transport decorator that persists downloaded bytes on disk.
///
/// Reads that hit the disk return `was_already_cached = true`. Failures to
/// write the cache are logged and never fail the download.
pub struct DiskCachedTransport<T> {
    directory: PathBuf,
    inner: T,
    name: String,
    hits: AtomicU64,
    misses: AtomicU64,
    write_failures: AtomicU64,
    temp_counter: AtomicU64,
}

/// Disk cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub write_failures: u64,
}

impl<T: Transport> DiskCachedTransport<T> {
    /// Wrap `inner`, storing bytes under `directory`.
    ///
    /// Creates the directory if needed.
    pub async fn open(directory: impl Into<PathBuf>, inner: T) -> Result<Self, TransportError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| TransportError::Io(format!("{}: {}", directory.display(), e)))?;

        info!(dir = %directory.display(), inner = inner.name(), "Disk byte cache opened");

        let name = format!("disk+{}", inner.name());
        Ok(Self {
            directory,
            inner,
            name,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn stats(&self) -> DiskCacheStats {
        DiskCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn url_to_filename(url: &str) -> String {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        format!("{:016x}.cache", hasher.finish())
    }

    /// Path of the cache file for `url`.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.directory.join(Self::url_to_filename(url))
    }

    async fn store(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let sequence = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = path.with_extension(format!("{}.tmp", sequence));
        let written = match tokio::fs::write(&temp_path, bytes).await {
            Ok(()) => tokio::fs::rename(&temp_path, path).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        written
    }
}

impl<T: Transport> Transport for DiskCachedTransport<T> {
    async fn download(&self, url: &str) -> Result<Downloaded, TransportError> {
        let path = self.path_for(url);

        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(url = url, bytes = bytes.len(), "Disk cache hit");
                return Ok(Downloaded::cached(bytes));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(url = url, path = %path.display(), error = %e, "Disk cache read failed");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let downloaded = self.inner.download(url).await?;

        if let Err(e) = self.store(&path, &downloaded.bytes).await {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(url = url, path = %path.display(), error = %e, "Disk cache write failed");
        }

        Ok(downloaded)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Serves fixed bytes and counts calls.
    struct FixedTransport {
        calls: Arc<AtomicUsize>,
    }

    impl Transport for FixedTransport {
        async fn download(&self, url: &str) -> Result<Downloaded, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("missing") {
                return Err(TransportError::Status {
                    status: 404,
                    url: url.to_string(),
                });
            }
            Ok(Downloaded::fetched(format!("bytes of {}", url).into_bytes()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    async fn open(dir: &TempDir) -> (DiskCachedTransport<FixedTransport>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = DiskCachedTransport::open(
            dir.path(),
            FixedTransport {
                calls: Arc::clone(&calls),
            },
        )
        .await
        .unwrap();
        (transport, calls)
    }

    #[tokio::test]
    async fn test_second_download_is_served_from_disk() {
        let dir = TempDir::new().unwrap();
        let (transport, calls) = open(&dir).await;

        let first = transport.download("https://example.com/a.png").await.unwrap();
        let second = transport.download("https://example.com/a.png").await.unwrap();

        assert!(!first.was_already_cached);
        assert!(second.was_already_cached);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.stats(),
            DiskCacheStats {
                hits: 1,
                misses: 1,
                write_failures: 0
            }
        );
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (transport, _) = open(&dir).await;
            transport.download("https://example.com/a.png").await.unwrap();
        }

        let (transport, calls) = open(&dir).await;
        let downloaded = transport.download("https://example.com/a.png").await.unwrap();
        assert!(downloaded.was_already_cached);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let (transport, calls) = open(&dir).await;

        assert!(transport.download("https://example.com/missing.png").await.is_err());
        assert!(transport.download("https://example.com/missing.png").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!transport.path_for("https://example.com/missing.png").exists());
    }

    #[tokio::test]
    async fn test_no_temp_files_remain() {
        let dir = TempDir::new().unwrap();
        let (transport, _) = open(&dir).await;
        transport.download("https://example.com/a.png").await.unwrap();

        let temps: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(temps.is_empty(), "Temp files should not remain");
        assert!(transport.path_for("https://example.com/a.png").exists());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_fail_download() {
        let dir = TempDir::new().unwrap();
        let (transport, _) = open(&dir).await;
        // A directory where the cache file should go makes the rename fail
        std::fs::create_dir(transport.path_for("https://example.com/a.png")).unwrap();

        let downloaded = transport.download("https://example.com/a.png").await.unwrap();
        assert!(!downloaded.was_already_cached);
        assert_eq!(transport.stats().write_failures, 1);
    }

    #[test]
    fn test_filenames_are_stable_and_distinct() {
        let a = DiskCachedTransport::<FixedTransport>::url_to_filename("a");
        let b = DiskCachedTransport::<FixedTransport>::url_to_filename("b");
        assert_eq!(a, DiskCachedTransport::<FixedTransport>::url_to_filename("a"));
        assert_ne!(a, b);
        assert!(a.ends_with(".cache"));
    }
}
