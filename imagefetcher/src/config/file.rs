//! INI configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use super::size::parse_size;
use super::FetcherConfig;
use crate::scheduler::LowPriorityAdmission;
use crate::transport::DEFAULT_TIMEOUT;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read or parse the file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// A key holds a value that cannot be used
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// Everything the INI file can set.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub fetcher: FetcherConfig,
    /// Directory for the disk byte cache.
    pub cache_directory: PathBuf,
    /// Wrap the HTTP transport in the disk cache.
    pub disk_cache_enabled: bool,
    /// HTTP request timeout.
    pub download_timeout: Duration,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            fetcher: FetcherConfig::default(),
            cache_directory: default_cache_directory(),
            disk_cache_enabled: true,
            download_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ConfigFile {
    /// Load from the default path, falling back to defaults if it is absent.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        parse_ini(&ini)
    }

    /// Parse configuration from INI text.
    pub fn parse(content: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(content)
            .map_err(|e| ConfigFileError::ReadError(ini::Error::Parse(e)))?;
        parse_ini(&ini)
    }
}

/// Default disk cache directory (`$XDG_CACHE_HOME/imagefetcher` or platform equivalent).
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imagefetcher")
}

/// Default config file path (`$XDG_CONFIG_HOME/imagefetcher/config.ini`).
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imagefetcher")
        .join("config.ini")
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_positive(section: &str, key: &str, value: &str) -> Result<usize, ConfigFileError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(section, key, value, "must be a positive integer")),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigFileError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "must be true or false")),
    }
}

fn parse_fetcher(section: &Properties, config: &mut FetcherConfig) -> Result<(), ConfigFileError> {
    if let Some(v) = section.get("max_concurrent_downloads") {
        config.max_concurrent_downloads = parse_positive("fetcher", "max_concurrent_downloads", v)?;
    }
    if let Some(v) = section.get("low_priority") {
        config.low_priority = match v.trim().to_ascii_lowercase().as_str() {
            "idle" | "when_idle" => LowPriorityAdmission::WhenIdle,
            other => match other.parse::<usize>() {
                Ok(limit) if limit > 0 => LowPriorityAdmission::Capped(limit),
                _ => {
                    return Err(invalid(
                        "fetcher",
                        "low_priority",
                        v,
                        "must be 'idle' or a positive number",
                    ))
                }
            },
        };
    }
    Ok(())
}

/// Overlay INI values onto the defaults.
fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [fetcher] section
    if let Some(section) = ini.section(Some("fetcher")) {
        parse_fetcher(section, &mut config.fetcher)?;
    }

    // [cache] section
    if let Some(section) = ini.section(Some("cache")) {
        if let Some(v) = section.get("memory_size") {
            let bytes = parse_size(v).map_err(|_| {
                invalid("cache", "memory_size", v, "expected format like '128MB' or '1GB'")
            })?;
            config.fetcher.memory_cache_bytes = bytes as u64;
        }
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.cache_directory = expand_tilde(v);
            }
        }
        if let Some(v) = section.get("disk_enabled") {
            config.disk_cache_enabled = parse_bool("cache", "disk_enabled", v)?;
        }
    }

    // [download] section
    if let Some(section) = ini.section(Some("download")) {
        if let Some(v) = section.get("timeout") {
            let seconds = parse_positive("download", "timeout", v)?;
            config.download_timeout = Duration::from_secs(seconds as u64);
        }
    }

    Ok(config)
}

/// Expand ~ to home directory in paths.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
