//! Snapshot building.
//!
//! [`build`] lists one watched root and returns a [`Snapshot`] of everything
//! the [`PathFilter`] admits. The root itself is always part of the result;
//! the filter only judges what is discovered below it.
//!
//! Building performs blocking filesystem I/O. The poll loop runs it on the
//! blocking thread pool, one task per root.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use crate::error::WatchError;
use crate::filter::PathFilter;
use crate::record::{FileRecord, Snapshot};

/// Lists `root` and returns a snapshot of the admitted entries.
///
/// With `recursive` unset, only the root and its direct children are listed.
/// Otherwise the whole subtree is walked; a directory rejected by the filter
/// is pruned together with its descendants. Symbolic links below the root
/// are recorded but never followed.
///
/// # Errors
///
/// - [`WatchError::NotFound`] if `root` does not exist
/// - [`WatchError::Io`] if the root or an entry below it cannot be read
/// - [`WatchError::Filter`] if a filter hook fails
///
/// Entries that disappear while the listing is in progress are skipped.
///
/// # Examples
///
/// ```no_run
/// use pw_watcher::{PathFilter, snapshot};
/// use camino::Utf8Path;
///
/// let files = snapshot::build(Utf8Path::new("/tmp/w"), true, &PathFilter::new())?;
/// for (path, record) in &files {
///     println!("{path}: {} bytes", record.size());
/// }
/// # Ok::<(), pw_watcher::WatchError>(())
/// ```
pub fn build(root: &Utf8Path, recursive: bool, filter: &PathFilter) -> Result<Snapshot, WatchError> {
    let metadata = fs::metadata(root).map_err(|e| root_error(root, e))?;

    let mut snapshot = Snapshot::default();
    let is_dir = metadata.is_dir();
    snapshot.insert(root.to_owned(), FileRecord::from_metadata(root.to_owned(), &metadata));
    if !is_dir {
        return Ok(snapshot);
    }

    if recursive {
        walk(root, filter, &mut snapshot)?;
    } else {
        list_children(root, filter, &mut snapshot)?;
    }

    tracing::trace!(root = %root, recursive, entries = snapshot.len(), "Built snapshot");
    Ok(snapshot)
}

fn list_children(root: &Utf8Path, filter: &PathFilter, snapshot: &mut Snapshot) -> Result<(), WatchError> {
    let entries = fs::read_dir(root).map_err(|e| root_error(root, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| WatchError::io(root, e))?;
        let path = match Utf8PathBuf::from_path_buf(entry.path()) {
            Ok(path) => path,
            Err(path) => {
                tracing::warn!(path = %path.display(), "Skipping entry with non UTF-8 path");
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(WatchError::io(path, e)),
        };

        let record = FileRecord::from_metadata(path, &metadata);
        if admit(filter, &record)? {
            snapshot.insert(record.path().to_owned(), record);
        }
    }
    Ok(())
}

fn walk(root: &Utf8Path, filter: &PathFilter, snapshot: &mut Snapshot) -> Result<(), WatchError> {
    let mut entries = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();

    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let vanished = err
                    .io_error()
                    .is_some_and(|e| e.kind() == io::ErrorKind::NotFound);
                if err.depth() == 0 {
                    let e = io::Error::from(err);
                    return Err(root_error(root, e));
                }
                if vanished {
                    continue;
                }
                let path = err
                    .path()
                    .and_then(Utf8Path::from_path)
                    .map_or_else(|| root.to_owned(), Utf8Path::to_owned);
                return Err(WatchError::io(path, io::Error::from(err)));
            }
        };

        let is_dir = entry.file_type().is_dir();
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            tracing::warn!(path = %entry.path().display(), "Skipping entry with non UTF-8 path");
            if is_dir {
                entries.skip_current_dir();
            }
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) if err.io_error().is_some_and(|e| e.kind() == io::ErrorKind::NotFound) => continue,
            Err(err) => return Err(WatchError::io(path, io::Error::from(err))),
        };

        let record = FileRecord::from_metadata(path.to_owned(), &metadata);
        if admit(filter, &record)? {
            snapshot.insert(record.path().to_owned(), record);
        } else if is_dir {
            entries.skip_current_dir();
        }
    }
    Ok(())
}

fn admit(filter: &PathFilter, record: &FileRecord) -> Result<bool, WatchError> {
    filter.included(record).map_err(|source| WatchError::Filter {
        path: record.path().to_owned(),
        source,
    })
}

fn root_error(root: &Utf8Path, err: io::Error) -> WatchError {
    if err.kind() == io::ErrorKind::NotFound {
        WatchError::NotFound(root.to_owned())
    } else {
        WatchError::io(root, err)
    }
}
