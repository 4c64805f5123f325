//! Snapshot comparison.
//!
//! [`diff`] turns two snapshots of the same roots into an ordered batch of
//! [`Event`]s:
//!
//! 1. `WRITE` / `CHMOD` for paths present in both snapshots
//! 2. `RENAME` / `MOVE` for removed and created paths that hold the same file
//! 3. `CREATE` (plus `WRITE` when non-empty) for the remaining new paths
//! 4. `REMOVE` for the remaining vanished paths
//!
//! Within each group events are ordered by path.
//!
//! # Rename and move inference
//!
//! A removed path and a created path pair up when their records describe the
//! same underlying file (see [`FileRecord::same_file`]). The pair becomes a
//! `RENAME` when both paths share a parent directory and a `MOVE` otherwise.
//! Pairing is greedy: removed paths are visited in order and each takes the
//! first matching created path. Without OS identities, distinct files with
//! identical size, mode and modification time can pair the wrong way round.

use std::collections::BTreeMap;

use camino::Utf8Path;
use pw_core::Op;

use crate::events::Event;
use crate::record::{FileRecord, Snapshot};

/// Compares `previous` against `current` and classifies every difference.
///
/// # Examples
///
/// ```
/// use pw_watcher::{diff, FileIdentity, FileRecord, Snapshot};
/// use pw_core::Op;
///
/// let id = FileIdentity { dev: 1, ino: 9 };
/// let mut previous = Snapshot::default();
/// previous.insert("/w/a.txt".into(), FileRecord::new("/w/a.txt").with_identity(id));
/// let mut current = Snapshot::default();
/// current.insert("/w/b.txt".into(), FileRecord::new("/w/b.txt").with_identity(id));
///
/// let events = diff(&previous, &current);
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].op, Op::Rename);
/// ```
#[must_use]
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<Event> {
    let mut events = Vec::new();

    let mut removed: BTreeMap<&Utf8Path, &FileRecord> = previous
        .iter()
        .filter(|(path, _)| !current.contains_key(*path))
        .map(|(path, record)| (path.as_path(), record))
        .collect();
    let mut created: BTreeMap<&Utf8Path, &FileRecord> = BTreeMap::new();
    let mut kept: BTreeMap<&Utf8Path, (&FileRecord, &FileRecord)> = BTreeMap::new();
    for (path, record) in current {
        match previous.get(path) {
            Some(old) => {
                kept.insert(path, (old, record));
            }
            None => {
                created.insert(path, record);
            }
        }
    }

    for (old, new) in kept.into_values() {
        if old.modified() != new.modified() || old.size() != new.size() {
            events.push(Event::new(Op::Write, new.clone()));
        }
        if old.mode() != new.mode() {
            events.push(Event::new(Op::Chmod, new.clone()));
        }
    }

    removed.retain(|old_path, old| {
        let Some(new_path) = created
            .iter()
            .find(|(_, new)| old.same_file(new))
            .map(|(path, _)| *path)
        else {
            return true;
        };
        let Some(new) = created.remove(new_path) else {
            return true;
        };
        let op = if old_path.parent() == new_path.parent() {
            Op::Rename
        } else {
            Op::Move
        };
        events.push(Event::relocated(op, (*old_path).to_owned(), new.clone()));
        false
    });

    for record in created.into_values() {
        events.push(Event::new(Op::Create, record.clone()));
        if record.size() > 0 {
            events.push(Event::new(Op::Write, record.clone()));
        }
    }

    events.extend(
        removed
            .into_values()
            .map(|record| Event::new(Op::Remove, record.clone())),
    );

    events
}
