//! Entry filtering for snapshot building.
//!
//! This module decides which discovered filesystem entries end up in a
//! snapshot. Three rules are applied, in order:
//!
//! 1. **Ignore set**: the entry is, or is nested under, an ignored path
//! 2. **Hidden files**: the entry is hidden and hidden files are ignored
//! 3. **Filter hooks**: user hooks, in registration order; first veto wins
//!
//! A vetoed directory is pruned together with its whole subtree.
//!
//! # Examples
//!
//! ```
//! use pw_watcher::{FileRecord, FilterError, PathFilter, Verdict};
//!
//! let filter = PathFilter::new()
//!     .with_ignore_hidden(true)
//!     .with_hook(|record: &FileRecord| -> Result<Verdict, FilterError> {
//!         Ok(if record.size() > 1024 { Verdict::Skip } else { Verdict::Include })
//!     });
//!
//! assert!(filter.included(&FileRecord::new("/w/a.txt"))?);
//! assert!(!filter.included(&FileRecord::new("/w/.git"))?);
//! assert!(!filter.included(&FileRecord::new("/w/big.bin").with_size(4096))?);
//! # Ok::<(), FilterError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use regex::Regex;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::error::FilterError;
use crate::record::FileRecord;

/// Outcome of a filter hook for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Keep the entry in the snapshot.
    Include,

    /// Leave the entry (and, for directories, its subtree) out.
    Skip,
}

/// A user-supplied predicate consulted for every discovered entry.
///
/// Hooks run on the blocking pool while snapshots are built, so they must be
/// [`Send`] + [`Sync`] + `'static`. Closures with the matching signature are
/// hooks too.
///
/// # Examples
///
/// ```
/// use pw_watcher::{FileRecord, FilterError, FilterHook, Verdict};
///
/// struct NoLogs;
///
/// impl FilterHook for NoLogs {
///     fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError> {
///         if record.path().extension() == Some("log") {
///             Ok(Verdict::Skip)
///         } else {
///             Ok(Verdict::Include)
///         }
///     }
/// }
/// ```
pub trait FilterHook: Send + Sync + 'static {
    /// Decides whether `record` belongs in the snapshot.
    ///
    /// Returning an error aborts the snapshot build that is in progress.
    fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError>;
}

impl<F> FilterHook for F
where
    F: Fn(&FileRecord) -> Result<Verdict, FilterError> + Send + Sync + 'static,
{
    fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError> {
        self(record)
    }
}

/// Keeps entries whose file name (or full path) matches a regular expression.
///
/// Directories always pass so that matching files below them stay reachable.
///
/// # Examples
///
/// ```
/// use pw_watcher::{FileRecord, FilterHook, RegexHook, Verdict};
/// use regex::Regex;
///
/// let hook = RegexHook::new(Regex::new(r"^[a-z]+\.txt$").expect("valid regex"));
/// assert_eq!(hook.filter(&FileRecord::new("/w/notes.txt"))?, Verdict::Include);
/// assert_eq!(hook.filter(&FileRecord::new("/w/Notes.md"))?, Verdict::Skip);
/// # Ok::<(), pw_watcher::FilterError>(())
/// ```
#[derive(Debug, Clone)]
pub struct RegexHook {
    regex: Regex,
    full_path: bool,
}

impl RegexHook {
    /// Creates a hook matching the file name against `regex`.
    #[must_use]
    pub const fn new(regex: Regex) -> Self {
        Self {
            regex,
            full_path: false,
        }
    }

    /// Matches the absolute path instead of the file name.
    #[must_use]
    pub const fn full_path(mut self) -> Self {
        self.full_path = true;
        self
    }
}

impl FilterHook for RegexHook {
    fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError> {
        if record.is_dir() {
            return Ok(Verdict::Include);
        }
        let haystack = if self.full_path {
            record.path().as_str()
        } else {
            record.name()
        };
        Ok(if self.regex.is_match(haystack) {
            Verdict::Include
        } else {
            Verdict::Skip
        })
    }
}

/// Keeps files with one of the listed extensions.
///
/// Directories always pass.
///
/// # Examples
///
/// ```
/// use pw_watcher::{ExtensionHook, FileRecord, FilterHook, Verdict};
///
/// let hook = ExtensionHook::new(&["rs", "toml"]);
/// assert_eq!(hook.filter(&FileRecord::new("/w/lib.rs"))?, Verdict::Include);
/// assert_eq!(hook.filter(&FileRecord::new("/w/notes.md"))?, Verdict::Skip);
/// # Ok::<(), pw_watcher::FilterError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ExtensionHook {
    extensions: SmallVec<[String; 8]>,
}

impl ExtensionHook {
    /// Creates a hook accepting the given extensions (without the leading dot).
    #[must_use]
    pub fn new(extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

impl FilterHook for ExtensionHook {
    fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError> {
        if record.is_dir() {
            return Ok(Verdict::Include);
        }
        let accepted = record
            .path()
            .extension()
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext));
        Ok(if accepted {
            Verdict::Include
        } else {
            Verdict::Skip
        })
    }
}

/// Skips entries matching gitignore-style patterns.
///
/// Patterns are anchored at `root`, exactly like a `.gitignore` file placed
/// in that directory.
///
/// # Examples
///
/// ```
/// use pw_watcher::{FileRecord, FilterHook, GlobHook, Verdict};
/// use camino::Utf8Path;
///
/// let hook = GlobHook::new(Utf8Path::new("/w"), &["target/", "*.tmp"])?;
/// assert_eq!(hook.filter(&FileRecord::new("/w/a.tmp"))?, Verdict::Skip);
/// assert_eq!(hook.filter(&FileRecord::new("/w/target").with_dir(true))?, Verdict::Skip);
/// assert_eq!(hook.filter(&FileRecord::new("/w/src.rs"))?, Verdict::Include);
/// # Ok::<(), pw_watcher::FilterError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GlobHook {
    matcher: Gitignore,
}

impl GlobHook {
    /// Compiles `patterns` relative to `root`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] when a pattern is not a valid glob.
    pub fn new(root: &Utf8Path, patterns: &[&str]) -> Result<Self, FilterError> {
        let mut builder = GitignoreBuilder::new(root.as_std_path());
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| FilterError::new(format!("invalid pattern '{pattern}': {e}")))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| FilterError::new(e.to_string()))?;
        Ok(Self { matcher })
    }
}

impl FilterHook for GlobHook {
    fn filter(&self, record: &FileRecord) -> Result<Verdict, FilterError> {
        let matched = self
            .matcher
            .matched(record.path().as_std_path(), record.is_dir());
        Ok(if matched.is_ignore() {
            Verdict::Skip
        } else {
            Verdict::Include
        })
    }
}

/// The combined inclusion rules of a watch set at one instant.
///
/// Cheap to clone: hooks are shared, the ignore set is copied.
#[derive(Clone, Default)]
pub struct PathFilter {
    ignore_hidden: bool,
    ignored: FxHashSet<Utf8PathBuf>,
    hooks: Vec<Arc<dyn FilterHook>>,
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFilter")
            .field("ignore_hidden", &self.ignore_hidden)
            .field("ignored", &self.ignored)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl PathFilter {
    /// Creates a filter that includes everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) const fn from_parts(
        ignore_hidden: bool,
        ignored: FxHashSet<Utf8PathBuf>,
        hooks: Vec<Arc<dyn FilterHook>>,
    ) -> Self {
        Self {
            ignore_hidden,
            ignored,
            hooks,
        }
    }

    /// Leaves hidden entries out.
    #[must_use]
    pub const fn with_ignore_hidden(mut self, ignore_hidden: bool) -> Self {
        self.ignore_hidden = ignore_hidden;
        self
    }

    /// Adds an absolute path to the ignore set.
    #[must_use]
    pub fn with_ignored(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.ignored.insert(path.into());
        self
    }

    /// Appends a filter hook.
    #[must_use]
    pub fn with_hook(mut self, hook: impl FilterHook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Returns `true` if `path` is ignored or nested under an ignored path.
    #[must_use]
    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        is_ignored(&self.ignored, path)
    }

    /// Decides whether `record` belongs in a snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the first hard error raised by a hook.
    pub fn included(&self, record: &FileRecord) -> Result<bool, FilterError> {
        if self.is_ignored(record.path()) {
            tracing::trace!(path = %record.path(), "Skipping ignored entry");
            return Ok(false);
        }
        if self.ignore_hidden && record.is_hidden() {
            tracing::trace!(path = %record.path(), "Skipping hidden entry");
            return Ok(false);
        }
        for hook in &self.hooks {
            if hook.filter(record)? == Verdict::Skip {
                tracing::trace!(path = %record.path(), "Entry vetoed by filter hook");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Returns `true` if `path` or one of its ancestors is in `ignored`.
pub(crate) fn is_ignored(ignored: &FxHashSet<Utf8PathBuf>, path: &Utf8Path) -> bool {
    !ignored.is_empty() && path.ancestors().any(|ancestor| ignored.contains(ancestor))
}

/// Returns `true` if the entry at `path` counts as hidden on this platform.
#[cfg(not(windows))]
pub(crate) fn is_hidden_path(path: &Utf8Path) -> bool {
    path.file_name().is_some_and(|name| name.starts_with('.'))
}

/// Returns `true` if the entry at `path` counts as hidden on this platform.
#[cfg(windows)]
pub(crate) fn is_hidden_path(path: &Utf8Path) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    std::fs::metadata(path).is_ok_and(|m| m.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn include_all(_: &FileRecord) -> Result<Verdict, FilterError> {
        Ok(Verdict::Include)
    }

    #[test]
    fn test_empty_filter_includes_everything() {
        let filter = PathFilter::new();
        assert!(filter.included(&FileRecord::new("/w/a.txt")).expect("no hook error"));
        assert!(filter.included(&FileRecord::new("/w/.hidden")).expect("no hook error"));
    }

    #[test]
    fn test_ignored_path_and_descendants() {
        let filter = PathFilter::new().with_ignored("/w/build");
        assert!(filter.is_ignored(Utf8Path::new("/w/build")));
        assert!(filter.is_ignored(Utf8Path::new("/w/build/out/a.o")));
        assert!(!filter.is_ignored(Utf8Path::new("/w/builder")));
        assert!(!filter.is_ignored(Utf8Path::new("/w")));
    }

    #[test]
    fn test_hidden_rule_toggle() {
        let record = FileRecord::new("/w/.cache");
        assert!(PathFilter::new().included(&record).expect("ok"));
        assert!(!PathFilter::new().with_ignore_hidden(true).included(&record).expect("ok"));
    }

    #[test]
    fn test_first_veto_wins() {
        let filter = PathFilter::new()
            .with_hook(include_all)
            .with_hook(|_: &FileRecord| -> Result<Verdict, FilterError> { Ok(Verdict::Skip) })
            .with_hook(|_: &FileRecord| -> Result<Verdict, FilterError> {
                Err(FilterError::new("must not run"))
            });
        assert!(!filter.included(&FileRecord::new("/w/a.txt")).expect("veto before error"));
    }

    #[test]
    fn test_hook_error_propagates() {
        let filter = PathFilter::new().with_hook(|_: &FileRecord| -> Result<Verdict, FilterError> {
            Err(FilterError::new("boom"))
        });
        let err = filter
            .included(&FileRecord::new("/w/a.txt"))
            .expect_err("hook error");
        assert_eq!(err.reason(), "boom");
    }

    #[test]
    fn test_regex_hook_full_path() {
        let hook = RegexHook::new(Regex::new("^/w/src/").expect("regex")).full_path();
        assert_eq!(hook.filter(&FileRecord::new("/w/src/a.rs")), Ok(Verdict::Include));
        assert_eq!(hook.filter(&FileRecord::new("/w/docs/a.md")), Ok(Verdict::Skip));
        assert_eq!(
            hook.filter(&FileRecord::new("/w/docs").with_dir(true)),
            Ok(Verdict::Include)
        );
    }

    #[test]
    fn test_extension_hook() {
        let hook = ExtensionHook::new(&["rs"]);
        assert_eq!(hook.filter(&FileRecord::new("/w/main.rs")), Ok(Verdict::Include));
        assert_eq!(hook.filter(&FileRecord::new("/w/Makefile")), Ok(Verdict::Skip));
        assert_eq!(
            hook.filter(&FileRecord::new("/w/src").with_dir(true)),
            Ok(Verdict::Include)
        );
    }

    #[test]
    fn test_glob_hook() {
        let hook = GlobHook::new(Utf8Path::new("/w"), &["*.swp", "node_modules/"]).expect("globs");
        assert_eq!(hook.filter(&FileRecord::new("/w/a.swp")), Ok(Verdict::Skip));
        assert_eq!(hook.filter(&FileRecord::new("/w/sub/b.swp")), Ok(Verdict::Skip));
        assert_eq!(
            hook.filter(&FileRecord::new("/w/node_modules").with_dir(true)),
            Ok(Verdict::Skip)
        );
        assert_eq!(hook.filter(&FileRecord::new("/w/node_modules")), Ok(Verdict::Include));
        assert_eq!(hook.filter(&FileRecord::new("/w/a.rs")), Ok(Verdict::Include));
    }

    #[test]
    fn test_closure_hook() {
        let hook = |record: &FileRecord| -> Result<Verdict, FilterError> {
            Ok(if record.size() > 3 { Verdict::Skip } else { Verdict::Include })
        };
        assert_eq!(hook.filter(&FileRecord::new("/w/a").with_size(1)), Ok(Verdict::Include));
        assert_eq!(hook.filter(&FileRecord::new("/w/b").with_size(9)), Ok(Verdict::Skip));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_is_hidden_path() {
        assert!(is_hidden_path(Utf8Path::new("/w/.git")));
        assert!(!is_hidden_path(Utf8Path::new("/w/.git/config")));
        assert!(!is_hidden_path(Utf8Path::new("/")));
    }
}
