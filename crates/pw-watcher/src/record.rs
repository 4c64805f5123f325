//! Point-in-time file metadata.
//!
//! This module provides [`FileRecord`], the immutable metadata captured for
//! one filesystem entry during a polling cycle, and [`Snapshot`], the map of
//! every record captured in one cycle.

use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// All entries captured under the registered roots at one polling instant,
/// keyed by absolute path.
pub type Snapshot = FxHashMap<Utf8PathBuf, FileRecord>;

/// Name given to the placeholder record of a triggered event.
pub const TRIGGERED_EVENT_NAME: &str = "triggered event";

/// OS-level identity of a file (device and inode on Unix).
///
/// Two records with equal identities describe the same underlying file,
/// which is how moves and renames are told apart from delete-and-recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FileIdentity {
    /// Device the file lives on.
    pub dev: u64,
    /// Inode number on that device.
    pub ino: u64,
}

/// Metadata for one filesystem entry at one snapshot instant.
///
/// Records are immutable once captured; use the `with_*` builders to
/// construct one by hand (for triggered events or tests).
///
/// # Examples
///
/// ```
/// use pw_watcher::{FileIdentity, FileRecord};
///
/// let record = FileRecord::new("/tmp/w/a.txt")
///     .with_size(10)
///     .with_identity(FileIdentity { dev: 1, ino: 42 });
///
/// assert_eq!(record.name(), "a.txt");
/// assert_eq!(record.size(), 10);
/// assert!(!record.is_dir());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    path: Utf8PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
    mode: u32,
    is_dir: bool,
    hidden: bool,
    identity: Option<FileIdentity>,
}

impl FileRecord {
    /// Creates an empty record for `path`: zero size, epoch modification
    /// time, no mode bits, no identity.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let name = path.file_name().unwrap_or(path.as_str()).to_owned();
        let hidden = name.starts_with('.');
        Self {
            path,
            name,
            size: 0,
            modified: UNIX_EPOCH,
            mode: 0,
            is_dir: false,
            hidden,
            identity: None,
        }
    }

    /// Captures a record from filesystem metadata.
    #[must_use]
    pub fn from_metadata(path: Utf8PathBuf, metadata: &Metadata) -> Self {
        let mut record = Self::new(path);
        record.size = metadata.len();
        record.modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        record.mode = mode_bits(metadata);
        record.is_dir = metadata.is_dir();
        record.identity = identity(metadata);
        record.hidden = hidden_attribute(&record.name, metadata);
        record
    }

    /// Creates the placeholder record attached to triggered events.
    #[must_use]
    pub fn placeholder() -> Self {
        let mut record = Self::new("-").with_modified(SystemTime::now());
        record.name = TRIGGERED_EVENT_NAME.to_owned();
        record
    }

    /// Sets the size in bytes.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the modification time.
    #[must_use]
    pub const fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    /// Sets the permission bits.
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Marks the record as a directory.
    #[must_use]
    pub const fn with_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// Sets the OS identity.
    #[must_use]
    pub const fn with_identity(mut self, identity: FileIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Returns the absolute path of the entry.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the final path component.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the modification time.
    #[inline]
    #[must_use]
    pub const fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Returns the permission bits.
    ///
    /// On Unix this is the raw `st_mode`. Elsewhere only the read-only flag
    /// is available and is mapped to `0o444` / `0o666`.
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// Returns `true` if the entry is a directory.
    #[inline]
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Returns `true` if the entry is hidden on this platform.
    #[inline]
    #[must_use]
    pub const fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Returns the OS identity, when the platform provides one.
    #[inline]
    #[must_use]
    pub const fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    /// Returns `true` if both records describe the same underlying file.
    ///
    /// Identities are compared when both records carry one. Otherwise the
    /// records must agree on size, mode, modification time and kind.
    #[must_use]
    pub fn same_file(&self, other: &Self) -> bool {
        match (self.identity, other.identity) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.size == other.size
                    && self.mode == other.mode
                    && self.modified == other.modified
                    && self.is_dir == other.is_dir
            }
        }
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn identity(metadata: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_metadata: &Metadata) -> Option<FileIdentity> {
    None
}

#[cfg(windows)]
fn hidden_attribute(_name: &str, metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn hidden_attribute(name: &str, _metadata: &Metadata) -> bool {
    name.starts_with('.')
}
