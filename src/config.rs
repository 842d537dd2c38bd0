//! Configuration types for culld
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Parsing of `/etc/cachefilesd.conf` style configuration files
//!
//! The configuration file format is line oriented: blank lines and `#`
//! comments are skipped; every other line starts with a lowercase
//! command word, optionally followed by whitespace and a value.  A few
//! commands configure the daemon itself (`dir`, `brun`, `frun`,
//! `nocull`); every line except `nocull` is also forwarded verbatim to
//! the kernel before `bind`, so thresholds like `bcull` or `fstop`
//! reach the cachefiles subsystem untouched.

use crate::error::ConfigError;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cachefilesd.conf";

/// Cull daemon for the Linux cachefiles subsystem
#[derive(Parser, Debug, Clone)]
#[command(
    name = "culld",
    version,
    about = "Cull daemon for the Linux cachefiles subsystem",
    long_about = "Drives the cachefiles kernel module: binds the on-disk cache described\n\
                  by the configuration file, waits for the kernel to request space, and\n\
                  reclaims the least recently used cache files.",
    after_help = "EXAMPLES:\n    \
        culld\n    \
        culld -f /etc/cachefilesd.conf\n    \
        culld -N -d   # bind the cache but never cull, with debug logging"
)]
pub struct CliArgs {
    /// Configuration file to read
    #[arg(
        short = 'f',
        long = "config",
        default_value = DEFAULT_CONFIG_PATH,
        value_name = "FILE"
    )]
    pub config: PathBuf,

    /// Disable culling even when the kernel requests it
    #[arg(short = 'N', long)]
    pub nocull: bool,

    /// Verbose output (debug-level logging)
    #[arg(short = 'd', long)]
    pub debug: bool,
}

/// Validated daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the fscache tree (contains `cache` and `graveyard`)
    pub dir: PathBuf,

    /// Configuration lines forwarded to the kernel before `bind`,
    /// in file order
    pub kernel_config: Vec<String>,

    /// Block free-space high watermark, percent
    pub brun: u8,

    /// Inode free-space high watermark, percent
    pub frun: u8,

    /// Suppress culling even when the kernel requests it
    pub culling_disabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            kernel_config: Vec::new(),
            brun: 10,
            frun: 10,
            culling_disabled: false,
        }
    }
}

impl Config {
    /// Load and parse a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse configuration file contents
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (command, value) = split_command(line, line_no)?;

            match command {
                "dir" => config.dir = PathBuf::from(value),
                "brun" => config.brun = parse_percent(value, line_no)?,
                "frun" => config.frun = parse_percent(value, line_no)?,
                "nocull" => {
                    config.culling_disabled = true;
                    // local policy only, never forwarded
                    continue;
                }
                _ => {}
            }

            config.kernel_config.push(if value.is_empty() {
                command.to_string()
            } else {
                format!("{command} {value}")
            });
        }

        if config.dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDir);
        }

        Ok(config)
    }
}

/// Split a configuration line into its command word and trimmed value
fn split_command(line: &str, line_no: usize) -> Result<(&str, &str), ConfigError> {
    let end = line
        .find(|c: char| !c.is_ascii_lowercase())
        .unwrap_or(line.len());
    let command = &line[..end];
    if command.is_empty() {
        return Err(ConfigError::NoCommand { line: line_no });
    }

    let rest = &line[end..];
    if rest.is_empty() {
        return Ok((command, ""));
    }
    if !rest.starts_with(|c: char| c.is_ascii_whitespace()) {
        return Err(ConfigError::MalformedCommand { line: line_no });
    }

    Ok((command, rest.trim()))
}

/// Parse a `NN%` percentage in 0..=100
fn parse_percent(value: &str, line_no: usize) -> Result<u8, ConfigError> {
    let malformed = || ConfigError::MalformedPercent {
        line: line_no,
        value: value.to_string(),
    };

    let digits = value.strip_suffix('%').ok_or_else(malformed)?;
    let percent: u8 = digits.parse().map_err(|_| malformed())?;
    if percent > 100 {
        return Err(malformed());
    }
    Ok(percent)
}
