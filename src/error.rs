//! Error types for culld
//!
//! This module defines the error hierarchy for the daemon:
//! - Configuration file and CLI errors
//! - Control device (/dev/cachefiles) errors
//! - The chdir arbitration error delivered to cull operations
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - The cull core itself never surfaces errors to its caller; failures
//!   are counted and logged, and the completion always fires

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the daemon
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control device errors
    #[error("Control device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration file and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A line did not start with a command word
    #[error("Line {line}: no command")]
    NoCommand { line: usize },

    /// A command word was not followed by whitespace or end of line
    #[error("Line {line}: malformed command")]
    MalformedCommand { line: usize },

    /// A percentage value was not of the form `NN%` with NN in 0..=100
    #[error("Line {line}: malformed percentage '{value}'")]
    MalformedPercent { line: usize, value: String },

    /// The required `dir` setting is missing or empty
    #[error("No 'dir' setting")]
    MissingDir,
}

/// Control device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Failed to open /dev/cachefiles
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A command write to the device failed
    #[error("Failed to write command '{command}': {source}")]
    Write {
        command: String,
        source: std::io::Error,
    },

    /// A command write was truncated by the kernel
    #[error("Short write for command '{command}'")]
    ShortWrite { command: String },
}

/// The kernel refused to change the working directory for a batch of
/// cull operations.  Each affected operation counts one error and
/// finishes without submitting its cull command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("change-directory refused by kernel")]
pub struct ChdirError;

/// Result type alias for DaemonError
pub type Result<T> = std::result::Result<T, DaemonError>;
