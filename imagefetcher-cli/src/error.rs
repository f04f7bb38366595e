//! CLI error handling with user-friendly messages.

use std::fmt;
use std::path::PathBuf;
use std::process;

use imagefetcher::config::ConfigFileError;
use imagefetcher::{FetcherError, TransportError};

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration file could not be loaded
    Config(ConfigFileError),
    /// Command-line arguments that parse but make no sense together
    InvalidArgs(String),
    /// Failed to set up a transport
    Transport(TransportError),
    /// Failed to create the controller
    Controller(FetcherError),
    /// Failed to create the output directory
    OutputDir { path: PathBuf, error: std::io::Error },
    /// Failed to write a decoded image
    ImageWrite {
        path: PathBuf,
        error: image::ImageError,
    },
    /// Some fetches did not succeed
    FetchFailed { failed: usize, total: usize },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Config(_) => {
                eprintln!();
                eprintln!("Check the config file, or pass --config to use another one.");
            }
            CliError::Transport(_) => {
                eprintln!();
                eprintln!("Use --no-disk-cache if the cache directory is not writable.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::Transport(e) => write!(f, "Failed to set up transport: {}", e),
            CliError::Controller(e) => write!(f, "Failed to create controller: {}", e),
            CliError::OutputDir { path, error } => {
                write!(f, "Failed to create '{}': {}", path.display(), error)
            }
            CliError::ImageWrite { path, error } => {
                write!(f, "Failed to write image '{}': {}", path.display(), error)
            }
            CliError::FetchFailed { failed, total } => {
                write!(f, "{} of {} fetches failed", failed, total)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Transport(e) => Some(e),
            CliError::Controller(e) => Some(e),
            CliError::OutputDir { error, .. } => Some(error),
            CliError::ImageWrite { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e)
    }
}

impl From<FetcherError> for CliError {
    fn from(e: FetcherError) -> Self {
        CliError::Controller(e)
    }
}

impl From<TransportError> for CliError {
    fn from(e: TransportError) -> Self {
        CliError::Transport(e)
    }
}
