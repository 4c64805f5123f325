//! Configuration structures for pollwatch.
//!
//! This module provides configuration types for the polling watcher and the
//! command-line front end:
//!
//! - [`WatchConfig`] - Poll loop settings (interval, recursion, filtering, queue sizes)
//! - [`LogConfig`] - Diagnostic output settings
//! - [`Config`] - Root configuration combining all settings
//!
//! All configuration types implement [`Default`] and deserialize with
//! `#[serde(default)]`, so a configuration file only needs the keys it
//! overrides.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::op::Op;

/// Configuration for the polling watcher.
///
/// # Examples
///
/// ```
/// use pw_core::WatchConfig;
/// use std::time::Duration;
///
/// let config = WatchConfig::default();
/// assert_eq!(config.poll_interval(), Duration::from_millis(100));
/// assert!(config.recursive);
/// assert_eq!(config.max_events, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Time between two polling cycles, in milliseconds.
    pub poll_interval_ms: u64,

    /// Whether roots given on the command line are watched recursively.
    pub recursive: bool,

    /// Whether hidden files and directories are left out of snapshots.
    pub ignore_hidden: bool,

    /// Maximum number of events forwarded per cycle. `0` means unbounded.
    pub max_events: usize,

    /// Operations to forward. Empty means every operation.
    pub ops: Vec<Op>,

    /// Paths excluded from every snapshot.
    pub ignore: Vec<Utf8PathBuf>,

    /// Capacity of the event queue.
    ///
    /// A full queue blocks the poll loop until the consumer catches up.
    pub event_capacity: usize,

    /// Capacity of the error queue.
    pub error_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            recursive: true,
            ignore_hidden: false,
            max_events: 0,
            ops: Vec::new(),
            ignore: Vec::new(),
            event_capacity: 64,
            error_capacity: 16,
        }
    }
}

impl WatchConfig {
    /// Returns the polling interval as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks that every option holds a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] when the polling interval or one
    /// of the queue capacities is zero, and [`ConfigError::InvalidPath`] for
    /// an empty `ignore` entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_option(
                "poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "event_capacity",
                "must be greater than zero",
            ));
        }
        if self.error_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "error_capacity",
                "must be greater than zero",
            ));
        }
        if let Some(path) = self.ignore.iter().find(|path| path.as_str().trim().is_empty()) {
            return Err(ConfigError::invalid_path(path.clone(), "ignore entries must not be empty"));
        }
        Ok(())
    }
}

/// Configuration for diagnostic output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log level when `RUST_LOG` is not set.
    pub level: String,

    /// Whether to colorize log output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            ansi: true,
        }
    }
}

/// Root configuration for pollwatch.
///
/// # Examples
///
/// ```
/// use pw_core::Config;
///
/// let config = Config::from_json_str(r#"{"watch": {"poll_interval_ms": 250}}"#)?;
/// assert_eq!(config.watch.poll_interval_ms, 250);
/// assert_eq!(config.log.level, "info");
/// # Ok::<(), pw_core::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watcher configuration.
    pub watch: WatchConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Config {
    /// Parses and validates a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::InvalidOption`] when validation fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.watch.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, plus every
    /// error [`Config::from_json_str`] can return.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
