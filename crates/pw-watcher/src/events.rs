//! Event types for change notifications.
//!
//! This module provides [`Event`], one classified change emitted by the poll
//! loop, and [`CycleStats`], the per-cycle forwarding summary.
//!
//! # Event Flow
//!
//! ```text
//! Snapshot (previous) ─┐
//!                      ├─► diff ─► op filter ─► per-cycle cap ─► event queue
//! Snapshot (current)  ─┘
//! ```

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use pw_core::Op;
use serde::Serialize;

use crate::record::FileRecord;

/// A classified change to one watched path.
///
/// `old_path` is only set for [`Op::Rename`] and [`Op::Move`], where it holds
/// the path the entry had in the previous snapshot.
///
/// # Examples
///
/// ```
/// use pw_watcher::{Event, FileRecord};
/// use pw_core::Op;
///
/// let event = Event::relocated(
///     Op::Rename,
///     "/tmp/w/a.txt".into(),
///     FileRecord::new("/tmp/w/b.txt"),
/// );
/// assert_eq!(event.path.as_str(), "/tmp/w/b.txt");
/// assert_eq!(event.old_path.as_deref().map(|p| p.as_str()), Some("/tmp/w/a.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// The kind of change.
    pub op: Op,

    /// The current path of the entry (`-` for triggered events).
    pub path: Utf8PathBuf,

    /// The prior path for renames and moves.
    pub old_path: Option<Utf8PathBuf>,

    /// Metadata of the entry as last observed.
    pub record: FileRecord,
}

impl Event {
    /// Creates an event for an entry that stayed at its path.
    #[must_use]
    pub fn new(op: Op, record: FileRecord) -> Self {
        Self {
            op,
            path: record.path().to_owned(),
            old_path: None,
            record,
        }
    }

    /// Creates a rename or move event from `old_path` to the record's path.
    #[must_use]
    pub fn relocated(op: Op, old_path: Utf8PathBuf, record: FileRecord) -> Self {
        Self {
            op,
            path: record.path().to_owned(),
            old_path: Some(old_path),
            record,
        }
    }

    /// Returns `true` if the event has the given operation.
    #[inline]
    #[must_use]
    pub fn has(&self, op: Op) -> bool {
        self.op == op
    }

    /// Returns the final component of the event path.
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()
    }

    /// Returns the previous path, if the entry was relocated.
    #[inline]
    #[must_use]
    pub fn old_path(&self) -> Option<&Utf8Path> {
        self.old_path.as_deref()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.record.is_dir() { "DIRECTORY" } else { "FILE" };
        write!(f, "{kind} {:?} {}", self.record.name(), self.op)?;
        match &self.old_path {
            Some(old) => write!(f, " [{old} -> {}]", self.path),
            None => write!(f, " [{}]", self.path),
        }
    }
}

/// Forwarding summary for one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Events produced by the diff.
    pub detected: usize,

    /// Events delivered to the event queue.
    pub forwarded: usize,

    /// Events dropped by the operation filter.
    pub filtered: usize,

    /// Events discarded because the per-cycle cap was reached.
    pub capped: usize,
}

impl CycleStats {
    /// Creates a summary for a cycle that detected `detected` events.
    #[inline]
    #[must_use]
    pub const fn new(detected: usize) -> Self {
        Self {
            detected,
            forwarded: 0,
            filtered: 0,
            capped: 0,
        }
    }
}
