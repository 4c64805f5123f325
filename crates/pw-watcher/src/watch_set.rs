//! The mutable registration state of a watcher.
//!
//! [`WatchSet`] owns the registered roots, the stored snapshot, the ignore
//! set, filter hooks and forwarding policy. Every mutation takes one
//! exclusive lock; snapshots are built with the lock released.
//!
//! The poll loop reads the state through [`WatchSet::capture`] and writes the
//! result of a cycle back through [`WatchSet::commit`]. A generation counter
//! bumped by every mutation lets `commit` detect changes made while the cycle
//! was listing.

use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use pw_core::Op;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;
use crate::filter::{self, FilterHook, PathFilter};
use crate::record::{FileRecord, Snapshot};
use crate::snapshot;

/// A registered path and whether its subtree is watched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WatchRoot {
    /// Absolute, normalized path of the root.
    pub path: Utf8PathBuf,
    /// Whether the whole subtree is watched, or only direct children.
    pub recursive: bool,
}

impl WatchRoot {
    /// Returns `true` if snapshots of this root may contain `path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use pw_watcher::WatchRoot;
    /// use camino::Utf8Path;
    ///
    /// let root = WatchRoot { path: "/w".into(), recursive: false };
    /// assert!(root.covers(Utf8Path::new("/w/a.txt")));
    /// assert!(!root.covers(Utf8Path::new("/w/src/lib.rs")));
    /// ```
    #[must_use]
    pub fn covers(&self, path: &Utf8Path) -> bool {
        covers(&self.path, self.recursive, path)
    }
}

fn covers(root: &Utf8Path, recursive: bool, path: &Utf8Path) -> bool {
    if recursive {
        path.starts_with(root)
    } else {
        path == root || path.parent() == Some(root)
    }
}

/// Resolves `path` to an absolute, lexically normalized path.
///
/// `.` and `..` components are folded without touching the filesystem, so
/// the path does not need to exist.
///
/// # Errors
///
/// Returns [`WatchError::Path`] if the current directory is needed and
/// unavailable (or `path` is empty), and [`WatchError::NonUtf8Path`] if the
/// current directory is not valid UTF-8.
pub fn resolve_path(path: &Utf8Path) -> Result<Utf8PathBuf, WatchError> {
    let absolute = std::path::absolute(path.as_std_path()).map_err(|source| WatchError::Path {
        path: path.to_owned(),
        source,
    })?;
    let absolute = Utf8PathBuf::from_path_buf(absolute).map_err(WatchError::non_utf8_path)?;
    Ok(normalize(&absolute))
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut normalized = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_str()),
        }
    }
    normalized
}

/// Operation filter and per-cycle cap, captured at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct ForwardPolicy {
    ops: SmallVec<[Op; 6]>,
    max_events: usize,
}

impl ForwardPolicy {
    /// Returns `true` if events with `op` are forwarded.
    pub(crate) fn allows(&self, op: Op) -> bool {
        self.ops.is_empty() || self.ops.contains(&op)
    }

    /// Returns `true` once `forwarded` events exhaust the cycle's budget.
    pub(crate) const fn exhausted(&self, forwarded: usize) -> bool {
        self.max_events != 0 && forwarded >= self.max_events
    }
}

/// Everything a poll cycle needs, copied out under the lock.
#[derive(Debug)]
pub(crate) struct Capture {
    pub(crate) roots: Vec<WatchRoot>,
    pub(crate) filter: PathFilter,
    pub(crate) files: Snapshot,
    pub(crate) policy: ForwardPolicy,
    pub(crate) generation: u64,
}

#[derive(Default)]
struct State {
    roots: FxHashMap<Utf8PathBuf, bool>,
    files: Snapshot,
    ignored: FxHashSet<Utf8PathBuf>,
    hooks: Vec<Arc<dyn FilterHook>>,
    policy: ForwardPolicy,
    ignore_hidden: bool,
    generation: u64,
}

impl State {
    fn filter(&self) -> PathFilter {
        PathFilter::from_parts(self.ignore_hidden, self.ignored.clone(), self.hooks.clone())
    }

    fn skips_root(&self, path: &Utf8Path, hidden: bool) -> bool {
        filter::is_ignored(&self.ignored, path) || (hidden && self.ignore_hidden)
    }

    fn covered(&self, path: &Utf8Path) -> bool {
        self.roots
            .iter()
            .any(|(root, &recursive)| covers(root, recursive, path))
    }

    fn remove(&mut self, path: &Utf8Path) {
        self.roots.remove(path);
        self.files
            .retain(|p, _| p != path && p.parent() != Some(path));
        self.generation += 1;
    }

    fn remove_recursive(&mut self, path: &Utf8Path) {
        self.roots.retain(|root, _| !root.starts_with(path));
        self.files.retain(|p, _| !p.starts_with(path));
        self.generation += 1;
    }
}

/// Registered roots and their stored snapshot, guarded by one lock.
#[derive(Default)]
pub(crate) struct WatchSet {
    state: Mutex<State>,
}

impl WatchSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `path` and merges its initial snapshot into the stored one.
    ///
    /// Ignored paths, and hidden paths while hidden files are ignored, are
    /// accepted without being registered.
    pub(crate) fn add(&self, path: &Utf8Path, recursive: bool) -> Result<(), WatchError> {
        let path = resolve_path(path)?;
        let hidden = filter::is_hidden_path(&path);

        let filter = {
            let state = self.state.lock();
            if state.skips_root(&path, hidden) {
                tracing::debug!(path = %path, "Not watching ignored path");
                return Ok(());
            }
            state.filter()
        };

        let initial = snapshot::build(&path, recursive, &filter)?;

        let mut state = self.state.lock();
        if state.skips_root(&path, hidden) {
            tracing::debug!(path = %path, "Path was ignored while it was being listed");
            return Ok(());
        }
        let entries = initial.len();
        state.files.extend(initial);
        state.roots.insert(path.clone(), recursive);
        state.generation += 1;
        tracing::debug!(path = %path, recursive, entries, "Watching path");
        Ok(())
    }

    /// Deregisters `path` and purges it and its direct children.
    pub(crate) fn remove(&self, path: &Utf8Path) -> Result<(), WatchError> {
        let path = resolve_path(path)?;
        self.state.lock().remove(&path);
        tracing::debug!(path = %path, "Stopped watching path");
        Ok(())
    }

    /// Deregisters `path` and every root below it, purging every entry
    /// nested under it.
    pub(crate) fn remove_recursive(&self, path: &Utf8Path) -> Result<(), WatchError> {
        let path = resolve_path(path)?;
        self.state.lock().remove_recursive(&path);
        tracing::debug!(path = %path, "Stopped watching subtree");
        Ok(())
    }

    /// Removes each path recursively and adds it to the ignore set.
    ///
    /// Stops at the first path that cannot be resolved; earlier paths stay
    /// ignored.
    pub(crate) fn ignore<P: AsRef<Utf8Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<(), WatchError> {
        for path in paths {
            let path = resolve_path(path.as_ref())?;
            let mut state = self.state.lock();
            state.remove_recursive(&path);
            tracing::debug!(path = %path, "Ignoring path");
            state.ignored.insert(path);
        }
        Ok(())
    }

    pub(crate) fn record_of(&self, path: &Utf8Path) -> Option<FileRecord> {
        let path = resolve_path(path).ok()?;
        self.state.lock().files.get(&path).cloned()
    }

    pub(crate) fn watched_files(&self) -> Snapshot {
        self.state.lock().files.clone()
    }

    pub(crate) fn watched_roots(&self) -> Vec<WatchRoot> {
        let mut roots: Vec<WatchRoot> = self
            .state
            .lock()
            .roots
            .iter()
            .map(|(path, &recursive)| WatchRoot {
                path: path.clone(),
                recursive,
            })
            .collect();
        roots.sort_by(|a, b| a.path.cmp(&b.path));
        roots
    }

    pub(crate) fn set_max_events(&self, max_events: usize) {
        self.state.lock().policy.max_events = max_events;
    }

    pub(crate) fn filter_ops(&self, ops: impl IntoIterator<Item = Op>) {
        let mut ops: SmallVec<[Op; 6]> = ops.into_iter().collect();
        ops.sort_unstable();
        ops.dedup();
        self.state.lock().policy.ops = ops;
    }

    pub(crate) fn ignore_hidden_files(&self, ignore_hidden: bool) {
        self.state.lock().ignore_hidden = ignore_hidden;
    }

    pub(crate) fn add_filter_hook(&self, hook: Arc<dyn FilterHook>) {
        self.state.lock().hooks.push(hook);
    }

    /// Copies out what one poll cycle needs.
    pub(crate) fn capture(&self) -> Capture {
        let state = self.state.lock();
        let mut roots: Vec<WatchRoot> = state
            .roots
            .iter()
            .map(|(path, &recursive)| WatchRoot {
                path: path.clone(),
                recursive,
            })
            .collect();
        roots.sort_by(|a, b| a.path.cmp(&b.path));
        Capture {
            roots,
            filter: state.filter(),
            files: state.files.clone(),
            policy: state.policy.clone(),
            generation: state.generation,
        }
    }

    /// Drops a root that vanished, together with the entries it covered.
    pub(crate) fn deregister(&self, root: &WatchRoot) {
        let mut state = self.state.lock();
        if state.roots.remove(&root.path).is_some() {
            state.files.retain(|p, _| !root.covers(p));
            state.generation += 1;
        }
    }

    /// Replaces the stored snapshot with the result of a cycle.
    ///
    /// Returns `false` without touching anything if `cancel` fired. When the
    /// set changed since `captured_generation`, fresh entries no longer
    /// covered by a root (or now ignored) are dropped, and stored entries
    /// outside every captured root are kept.
    pub(crate) fn commit(
        &self,
        fresh: Snapshot,
        captured_roots: &[WatchRoot],
        captured_generation: u64,
        cancel: &CancellationToken,
    ) -> bool {
        let mut state = self.state.lock();
        if cancel.is_cancelled() {
            return false;
        }
        if state.generation == captured_generation {
            state.files = fresh;
            return true;
        }

        let mut merged: Snapshot = fresh
            .into_iter()
            .filter(|(path, _)| state.covered(path) && !filter::is_ignored(&state.ignored, path))
            .collect();
        for (path, record) in &state.files {
            if !captured_roots.iter().any(|root| root.covers(path)) {
                merged.entry(path.clone()).or_insert_with(|| record.clone());
            }
        }
        state.files = merged;
        true
    }

    /// Clears roots and stored snapshot and fires `cancel`, atomically with
    /// respect to [`WatchSet::commit`].
    pub(crate) fn reset(&self, cancel: &CancellationToken) {
        let mut state = self.state.lock();
        state.roots.clear();
        state.files.clear();
        state.generation += 1;
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::filter::Verdict;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let root = root.join("w");
        fs::create_dir_all(root.join("docs/img")).expect("create dirs");
        fs::write(root.join("a.txt"), b"0123456789").expect("write a");
        fs::write(root.join("docs/guide.md"), b"# guide").expect("write guide");
        fs::write(root.join("docs/img/logo.png"), b"png").expect("write logo");
        (dir, root)
    }

    #[test]
    fn test_resolve_path_normalizes() {
        let resolved = resolve_path(Utf8Path::new("/w/./docs/../a.txt")).expect("resolve");
        assert_eq!(resolved, Utf8PathBuf::from("/w/a.txt"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let resolved = resolve_path(Utf8Path::new("some/dir")).expect("resolve");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("some/dir"));
    }

    #[test]
    fn test_resolve_empty_path_fails() {
        let err = resolve_path(Utf8Path::new("")).expect_err("empty path");
        assert!(matches!(err, WatchError::Path { .. }));
    }

    #[test]
    fn test_root_covers() {
        let recursive = WatchRoot {
            path: "/w".into(),
            recursive: true,
        };
        assert!(recursive.covers(Utf8Path::new("/w")));
        assert!(recursive.covers(Utf8Path::new("/w/a/b/c")));
        assert!(!recursive.covers(Utf8Path::new("/wx/a")));
    }

    #[test]
    fn test_add_recursive_and_non_recursive() {
        let (_dir, root) = fixture();

        let set = WatchSet::new();
        set.add(&root, false).expect("add");
        assert_eq!(set.watched_files().len(), 3);

        let set = WatchSet::new();
        set.add(&root, true).expect("add recursive");
        assert_eq!(set.watched_files().len(), 6);
        assert_eq!(
            set.watched_roots(),
            vec![WatchRoot {
                path: root.clone(),
                recursive: true
            }]
        );
    }

    #[test]
    fn test_add_missing_path() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        let err = set.add(&root.join("nope"), true).expect_err("missing");
        assert!(matches!(err, WatchError::NotFound(_)));
        assert!(set.watched_roots().is_empty());
    }

    #[test]
    fn test_add_ignored_is_noop() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.ignore([root.join("docs")]).expect("ignore");
        set.add(&root.join("docs/img"), true).expect("add ignored");
        assert!(set.watched_roots().is_empty());
        assert!(set.watched_files().is_empty());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_add_hidden_is_noop_when_hidden_ignored() {
        let (_dir, root) = fixture();
        fs::create_dir(root.join(".cache")).expect("create hidden");
        let set = WatchSet::new();
        set.ignore_hidden_files(true);
        set.add(&root.join(".cache"), true).expect("add hidden");
        assert!(set.watched_roots().is_empty());
    }

    #[test]
    fn test_remove_purges_direct_children() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        set.remove(&root.join("docs")).expect("remove");

        let files = set.watched_files();
        assert!(!files.contains_key(&root.join("docs")));
        assert!(!files.contains_key(&root.join("docs/guide.md")));
        assert!(files.contains_key(&root.join("docs/img/logo.png")));
    }

    #[test]
    fn test_remove_recursive_purges_subtree() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        set.remove_recursive(&root.join("docs")).expect("remove");

        let files = set.watched_files();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key(&root));
        assert!(files.contains_key(&root.join("a.txt")));
    }

    #[test]
    fn test_ignore_retroactive_and_future() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        set.ignore([root.join("docs")]).expect("ignore");
        assert!(set.record_of(&root.join("docs/guide.md")).is_none());

        let capture = set.capture();
        let fresh = snapshot::build(&root, true, &capture.filter).expect("build");
        assert!(!fresh.keys().any(|p| p.starts_with(root.join("docs"))));
    }

    #[test]
    fn test_ignore_fails_fast() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        let err = set
            .ignore([root.join("docs"), Utf8PathBuf::new(), root.join("a.txt")])
            .expect_err("empty path");
        assert!(matches!(err, WatchError::Path { .. }));

        let filter = set.capture().filter;
        assert!(filter.is_ignored(&root.join("docs")));
        assert!(!filter.is_ignored(&root.join("a.txt")));
    }

    #[test]
    fn test_record_of() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        let record = set.record_of(&root.join("a.txt")).expect("record");
        assert_eq!(record.size(), 10);
        assert!(set.record_of(&root.join("missing")).is_none());
    }

    #[test]
    fn test_policy() {
        let set = WatchSet::new();
        assert!(set.capture().policy.allows(Op::Chmod));
        assert!(!set.capture().policy.exhausted(1_000));

        set.filter_ops([Op::Write, Op::Create, Op::Write]);
        set.set_max_events(2);
        let policy = set.capture().policy;
        assert!(policy.allows(Op::Write));
        assert!(!policy.allows(Op::Remove));
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
    }

    #[test]
    fn test_filter_hook_applies_to_add() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add_filter_hook(Arc::new(|record: &FileRecord| -> Result<Verdict, FilterError> {
            Ok(if record.name() == "img" { Verdict::Skip } else { Verdict::Include })
        }));
        set.add(&root, true).expect("add");
        assert_eq!(set.watched_files().len(), 4);
    }

    #[test]
    fn test_commit_replaces_when_unchanged() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        let capture = set.capture();

        let mut fresh = Snapshot::default();
        fresh.insert(root.clone(), FileRecord::new(root.clone()).with_dir(true));
        assert!(set.commit(fresh, &capture.roots, capture.generation, &CancellationToken::new()));
        assert_eq!(set.watched_files().len(), 1);
    }

    #[test]
    fn test_commit_skipped_when_cancelled() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        let capture = set.capture();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!set.commit(Snapshot::default(), &capture.roots, capture.generation, &cancel));
        assert_eq!(set.watched_files().len(), 6);
    }

    #[test]
    fn test_commit_keeps_roots_added_mid_cycle() {
        let (dir, root) = fixture();
        let other = Utf8PathBuf::try_from(dir.path().join("other")).expect("utf-8");
        fs::create_dir(&other).expect("create other");
        fs::write(other.join("x"), b"x").expect("write x");

        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        let capture = set.capture();
        let fresh = snapshot::build(&root, true, &capture.filter).expect("build");

        set.add(&other, true).expect("add mid-cycle");
        set.ignore([root.join("docs")]).expect("ignore mid-cycle");
        assert!(set.commit(fresh, &capture.roots, capture.generation, &CancellationToken::new()));

        let files = set.watched_files();
        assert!(files.contains_key(&other.join("x")));
        assert!(files.contains_key(&root.join("a.txt")));
        assert!(!files.contains_key(&root.join("docs/guide.md")));
    }

    #[test]
    fn test_deregister_and_reset() {
        let (_dir, root) = fixture();
        let set = WatchSet::new();
        set.add(&root, true).expect("add");
        set.deregister(&WatchRoot {
            path: root.clone(),
            recursive: true,
        });
        assert!(set.watched_roots().is_empty());
        assert!(set.watched_files().is_empty());

        set.add(&root, false).expect("add again");
        let cancel = CancellationToken::new();
        set.reset(&cancel);
        assert!(cancel.is_cancelled());
        assert!(set.watched_roots().is_empty());
        assert!(set.watched_files().is_empty());
    }
}
