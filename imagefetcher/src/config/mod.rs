//! Configuration.
//!
//! [`FetcherConfig`] holds the values fixed at controller construction.
//! [`ConfigFile`] loads them, plus transport settings, from an INI file:
//!
//! ```ini
//! [fetcher]
//! max_concurrent_downloads = 8
//! low_priority = idle
//!
//! [cache]
//! memory_size = 128MB
//! directory = ~/.cache/imagefetcher
//! disk_enabled = true
//!
//! [download]
//! timeout = 30
//! ```

mod file;
mod size;

pub use file::{config_file_path, default_cache_directory, ConfigFile, ConfigFileError};
pub use size::{format_size, parse_size, SizeParseError};

use crate::error::FetcherError;
use crate::scheduler::LowPriorityAdmission;

/// Default number of concurrent downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 8;

/// Default memory cache capacity (decoded bytes).
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 128 * 1024 * 1024;

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    /// Downloads admitted at once across all operations.
    pub max_concurrent_downloads: usize,
    /// Memory cache bound in decoded bytes.
    pub memory_cache_bytes: u64,
    /// How low-priority operations share download slots.
    pub low_priority: LowPriorityAdmission,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            low_priority: LowPriorityAdmission::WhenIdle,
        }
    }
}

impl FetcherConfig {
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    pub fn with_memory_cache_bytes(mut self, bytes: u64) -> Self {
        self.memory_cache_bytes = bytes;
        self
    }

    pub fn with_low_priority(mut self, admission: LowPriorityAdmission) -> Self {
        self.low_priority = admission;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), FetcherError> {
        if self.max_concurrent_downloads == 0 {
            return Err(FetcherError::InvalidConfig(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.low_priority == LowPriorityAdmission::Capped(0) {
            return Err(FetcherError::InvalidConfig(
                "a low-priority cap of 0 would never admit low-priority work".to_string(),
            ));
        }
        Ok(())
    }
}
