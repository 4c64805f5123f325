//! Error types for the pw-watcher crate.
//!
//! This module provides [`WatchError`] for everything the watch set, the
//! snapshot builder and the poll loop can report, and [`FilterError`] for
//! hard failures raised by user filter hooks.

use std::io;
use std::time::Duration;

use camino::Utf8PathBuf;
use pw_core::ConfigError;

/// A hard failure raised by a filter hook.
///
/// Returning this from a hook aborts the snapshot build it occurred in.
/// To leave a single entry out of a snapshot, return
/// [`Verdict::Skip`](crate::Verdict::Skip) instead.
///
/// # Examples
///
/// ```
/// use pw_watcher::FilterError;
///
/// let err = FilterError::new("quota lookup failed");
/// assert_eq!(err.reason(), "quota lookup failed");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct FilterError {
    reason: String,
}

impl FilterError {
    /// Creates a new filter error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Returns the reason given by the hook.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors that can occur while watching paths.
///
/// # Error Recovery Strategy
///
/// - **Path resolution** ([`WatchError::Path`], [`WatchError::NonUtf8Path`]):
///   fatal to the call that triggered it, the poll loop is unaffected
/// - **Root vanished** ([`WatchError::WatchedPathDeleted`]): reported on the
///   error queue, the root is deregistered, polling continues
/// - **Listing failures** ([`WatchError::Io`], [`WatchError::Filter`]): reported
///   on the error queue, the root keeps its previous entries for that cycle
/// - **Lifecycle misuse** ([`WatchError::InvalidInterval`],
///   [`WatchError::AlreadyRunning`]): returned synchronously, no state change
///
/// # Examples
///
/// ```
/// use pw_watcher::WatchError;
/// use camino::Utf8PathBuf;
///
/// fn handle_error(err: &WatchError) {
///     if err.is_recoverable() {
///         eprintln!("warning: {err}");
///     } else {
///         eprintln!("error: {err}");
///     }
/// }
///
/// handle_error(&WatchError::WatchedPathDeleted(Utf8PathBuf::from("/tmp/w")));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// A path could not be resolved to absolute form.
    #[error("failed to resolve path '{path}': {source}")]
    Path {
        /// The path as given by the caller.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The root of a snapshot does not exist.
    #[error("path does not exist: {0}")]
    NotFound(Utf8PathBuf),

    /// A previously watched root disappeared and was deregistered.
    #[error("watched file or directory deleted: {0}")]
    WatchedPathDeleted(Utf8PathBuf),

    /// Listing or stat-ing an entry failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being read when the failure occurred.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A filter hook raised a hard error.
    #[error("filter hook failed for {path}: {source}")]
    Filter {
        /// The entry the hook was evaluating.
        path: Utf8PathBuf,
        /// The error returned by the hook.
        #[source]
        source: FilterError,
    },

    /// `start` was called with an interval that cannot drive a poll loop.
    #[error("polling interval must be greater than zero, got {0:?}")]
    InvalidInterval(Duration),

    /// `start` was called while the poll loop is already running.
    #[error("watcher is already running")]
    AlreadyRunning,

    /// A path is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(std::path::PathBuf),

    /// The event queue receiver was dropped.
    #[error("event channel closed")]
    ChannelClosed,

    /// The watcher configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WatchError {
    /// Creates a new [`WatchError::Io`] error.
    #[inline]
    pub fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a new [`WatchError::NonUtf8Path`] error.
    #[inline]
    pub fn non_utf8_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self::NonUtf8Path(path.into())
    }

    /// Returns `true` if the poll loop carries on after reporting this error.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::WatchedPathDeleted(_) | Self::Io { .. } | Self::Filter { .. } | Self::NonUtf8Path(_)
        )
    }

    /// Returns `true` for errors caused by calling the lifecycle API in the
    /// wrong state or with a bad argument.
    #[inline]
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::InvalidInterval(_) | Self::AlreadyRunning)
    }

    /// Returns the file path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::Path { path, .. }
            | Self::NotFound(path)
            | Self::WatchedPathDeleted(path)
            | Self::Io { path, .. }
            | Self::Filter { path, .. } => Some(path),
            Self::InvalidInterval(_)
            | Self::AlreadyRunning
            | Self::NonUtf8Path(_)
            | Self::ChannelClosed
            | Self::Config(_) => None,
        }
    }
}
