//! CLI runner for common setup.
//!
//! Loads configuration, initializes logging and builds the transport.

use std::path::Path;

use tracing::info;

use imagefetcher::config::{config_file_path, ConfigFile};
use imagefetcher::logging::{default_log_dir, default_log_file, init_logging, LoggingGuard};
use imagefetcher::transport::{DiskCachedTransport, HttpTransport};

use crate::error::CliError;

/// Runner that owns the CLI's configuration and logging lifetime.
pub struct CliRunner {
    /// Logging guard - keeps logging active while runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    config: ConfigFile,
}

impl CliRunner {
    /// Load `config_path` (or the default config file) and start logging.
    pub fn new(config_path: Option<&Path>, verbose: bool) -> Result<Self, CliError> {
        let config = match config_path {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };

        let logging_guard = init_logging(&default_log_dir(), default_log_file(), verbose)
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        info!("imagefetcher v{}", imagefetcher::VERSION);
        info!(
            config = %config_path.map_or_else(config_file_path, Path::to_path_buf).display(),
            log = %logging_guard.log_path().display(),
            "CLI started"
        );

        Ok(Self {
            logging_guard,
            config,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// HTTP transport using the configured timeout.
    pub fn http_transport(&self) -> Result<HttpTransport, CliError> {
        Ok(HttpTransport::with_timeout(self.config.download_timeout)?)
    }

    /// HTTP transport behind the disk byte cache.
    pub async fn disk_cached_transport(
        &self,
    ) -> Result<DiskCachedTransport<HttpTransport>, CliError> {
        let http = self.http_transport()?;
        Ok(DiskCachedTransport::open(&self.config.cache_directory, http).await?)
    }
}
