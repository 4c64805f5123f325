//! Change classification for watch events.
//!
//! This module provides the [`Op`] enum describing what kind of change a
//! polling cycle observed for a path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The kind of change observed for a watched path.
///
/// # Examples
///
/// ```
/// use pw_core::Op;
///
/// assert_eq!(Op::Rename.to_string(), "RENAME");
/// assert!(Op::Move.is_relocation());
/// assert!(!Op::Write.is_relocation());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// A new path appeared.
    Create,

    /// The contents of a path changed (modification time or size differs).
    Write,

    /// A path disappeared.
    Remove,

    /// A path moved to a new name inside the same parent directory.
    Rename,

    /// The permission bits of a path changed.
    Chmod,

    /// A path moved to a different parent directory.
    Move,
}

impl Op {
    /// Every operation, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Write,
        Self::Remove,
        Self::Rename,
        Self::Chmod,
        Self::Move,
    ];

    /// Returns `true` for operations that carry a prior path
    /// ([`Rename`](Self::Rename) and [`Move`](Self::Move)).
    #[inline]
    #[must_use]
    pub const fn is_relocation(self) -> bool {
        matches!(self, Self::Rename | Self::Move)
    }

    /// Returns the upper-case label used in log lines and CLI output.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Write => "WRITE",
            Self::Remove => "REMOVE",
            Self::Rename => "RENAME",
            Self::Chmod => "CHMOD",
            Self::Move => "MOVE",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Op {
    type Err = ConfigError;

    /// Parses an operation name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::InvalidOption {
                option: "ops".to_owned(),
                reason: format!("unknown operation '{s}'"),
            })
    }
}
