//! Polling watcher with async event streaming.
//!
//! This module provides [`Watcher`], the handle used to register paths and
//! drive the poll loop, and [`EventStream`], the receiving end of its event
//! and error queues.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Poll Loop (Watcher::start)                   │
//! │  ┌────────────┐    ┌──────────────────┐    ┌────────────────┐   │
//! │  │ WatchSet   │ -> │ snapshot::build  │ -> │ diff + forward │   │
//! │  │ (capture)  │    │ (spawn_blocking, │    │ (op filter,    │   │
//! │  │            │    │  one per root)   │    │  event cap)    │   │
//! │  └─────▲──────┘    └──────────────────┘    └───────┬────────┘   │
//! │        └───────────── commit ──────────────────────┤            │
//! └────────────────────────────────────────────────────│────────────┘
//!                                                      │ mpsc
//!                                                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EventStream (events + errors) -> Dispatcher / caller           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A watcher is idle until [`Watcher::start`] is awaited. The returned
//! future polls until [`Watcher::close`] is called, so it is usually spawned
//! onto its own task. After a close the watcher can be started again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use pw_core::{Op, WatchConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::diff::diff;
use crate::error::WatchError;
use crate::events::{CycleStats, Event};
use crate::filter::FilterHook;
use crate::record::{FileRecord, Snapshot};
use crate::snapshot;
use crate::watch_set::{WatchRoot, WatchSet};

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Default capacity of the error queue.
pub const DEFAULT_ERROR_CAPACITY: usize = 16;

/// Path carried by events pushed through [`Watcher::trigger_event`].
pub const TRIGGERED_EVENT_PATH: &str = "-";

#[derive(Default)]
struct Lifecycle {
    running: bool,
    cancel: CancellationToken,
    exited: Option<watch::Receiver<()>>,
}

struct Inner {
    watch_set: WatchSet,
    lifecycle: Mutex<Lifecycle>,
    started: watch::Sender<bool>,
    event_tx: mpsc::Sender<Event>,
    error_tx: mpsc::Sender<WatchError>,
}

/// Marks the loop as stopped and signals `close` when the loop future ends,
/// whether it returned or was dropped.
struct RunGuard {
    inner: Arc<Inner>,
    _exited: watch::Sender<()>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.lifecycle.lock().running = false;
    }
}

/// A polling filesystem watcher.
///
/// `Watcher` is a cheap, cloneable handle; every clone drives the same watch
/// set and queues. All mutation methods are synchronous and may be called
/// from any thread, including while the poll loop is running.
///
/// # Examples
///
/// ```no_run
/// use pw_watcher::Watcher;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), pw_watcher::WatchError> {
/// let (watcher, mut stream) = Watcher::new();
/// watcher.add_recursive("./src")?;
///
/// let poller = watcher.clone();
/// tokio::spawn(async move { poller.start(Duration::from_millis(100)).await });
///
/// while let Some(event) = stream.recv().await {
///     println!("{event}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("running", &self.is_running())
            .field("roots", &self.watched_roots())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates an idle watcher with the default queue capacities.
    #[must_use]
    pub fn new() -> (Self, EventStream) {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY, DEFAULT_ERROR_CAPACITY)
    }

    /// Creates an idle watcher with the given queue capacities.
    ///
    /// Capacities below one are raised to one.
    #[must_use]
    pub fn with_capacity(events: usize, errors: usize) -> (Self, EventStream) {
        let (event_tx, event_rx) = mpsc::channel(events.max(1));
        let (error_tx, error_rx) = mpsc::channel(errors.max(1));
        let inner = Inner {
            watch_set: WatchSet::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            started: watch::Sender::new(false),
            event_tx,
            error_tx,
        };
        let watcher = Self {
            inner: Arc::new(inner),
        };
        let stream = EventStream {
            events: event_rx,
            errors: error_rx,
        };
        (watcher, stream)
    }

    /// Creates an idle watcher configured from `config`.
    ///
    /// Queue capacities, the event cap, the operation filter, the hidden-file
    /// rule and the ignore list are applied. Roots are not added.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] if the configuration is invalid and
    /// [`WatchError::Path`] if an ignored path cannot be resolved.
    pub fn from_config(config: &WatchConfig) -> Result<(Self, EventStream), WatchError> {
        config.validate()?;
        let (watcher, stream) = Self::with_capacity(config.event_capacity, config.error_capacity);
        watcher.set_max_events(config.max_events);
        watcher.filter_ops(config.ops.iter().copied());
        watcher.ignore_hidden_files(config.ignore_hidden);
        watcher.ignore(&config.ignore)?;
        Ok((watcher, stream))
    }

    /// Watches `path` and its direct children.
    ///
    /// Ignored paths, and hidden paths while hidden files are ignored, are
    /// silently skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Path`] if the path cannot be resolved,
    /// [`WatchError::NotFound`] if it does not exist, and
    /// [`WatchError::Io`] or [`WatchError::Filter`] if the initial listing
    /// fails.
    pub fn add(&self, path: impl AsRef<Utf8Path>) -> Result<(), WatchError> {
        self.inner.watch_set.add(path.as_ref(), false)
    }

    /// Watches `path` and its whole subtree.
    ///
    /// # Errors
    ///
    /// Same as [`Watcher::add`].
    pub fn add_recursive(&self, path: impl AsRef<Utf8Path>) -> Result<(), WatchError> {
        self.inner.watch_set.add(path.as_ref(), true)
    }

    /// Stops watching `path`, forgetting it and its direct children.
    pub fn remove(&self, path: impl AsRef<Utf8Path>) -> Result<(), WatchError> {
        self.inner.watch_set.remove(path.as_ref())
    }

    /// Stops watching `path`, forgetting every entry below it.
    pub fn remove_recursive(&self, path: impl AsRef<Utf8Path>) -> Result<(), WatchError> {
        self.inner.watch_set.remove_recursive(path.as_ref())
    }

    /// Excludes `paths` (and everything below them) from all future
    /// snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Path`] for the first path that cannot be
    /// resolved. Paths before it remain ignored.
    pub fn ignore<P: AsRef<Utf8Path>>(&self, paths: impl IntoIterator<Item = P>) -> Result<(), WatchError> {
        self.inner.watch_set.ignore(paths)
    }

    /// Returns the stored record for `path`, if it is being watched.
    #[must_use]
    pub fn record_of(&self, path: impl AsRef<Utf8Path>) -> Option<FileRecord> {
        self.inner.watch_set.record_of(path.as_ref())
    }

    /// Returns a copy of the stored snapshot.
    #[must_use]
    pub fn watched_files(&self) -> Snapshot {
        self.inner.watch_set.watched_files()
    }

    /// Returns the registered roots, sorted by path.
    #[must_use]
    pub fn watched_roots(&self) -> Vec<WatchRoot> {
        self.inner.watch_set.watched_roots()
    }

    /// Caps the number of events forwarded per cycle. `0` removes the cap.
    pub fn set_max_events(&self, max_events: usize) {
        self.inner.watch_set.set_max_events(max_events);
    }

    /// Forwards only events with one of `ops`. An empty list forwards all.
    pub fn filter_ops(&self, ops: impl IntoIterator<Item = Op>) {
        self.inner.watch_set.filter_ops(ops);
    }

    /// Sets whether hidden files and directories are left out.
    pub fn ignore_hidden_files(&self, ignore_hidden: bool) {
        self.inner.watch_set.ignore_hidden_files(ignore_hidden);
    }

    /// Registers a filter hook, consulted after every hook added before it.
    pub fn add_filter_hook(&self, hook: impl FilterHook) {
        self.inner.watch_set.add_filter_hook(Arc::new(hook));
    }

    /// Returns `true` while the poll loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().running
    }

    /// Runs the poll loop, one cycle every `interval`, until
    /// [`Watcher::close`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidInterval`] if `interval` is zero and
    /// [`WatchError::AlreadyRunning`] if the loop is already running. Neither
    /// changes any state.
    pub async fn start(&self, interval: Duration) -> Result<(), WatchError> {
        if interval.is_zero() {
            return Err(WatchError::InvalidInterval(interval));
        }

        let (cancel, exited) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.running {
                return Err(WatchError::AlreadyRunning);
            }
            let (exit_tx, exit_rx) = watch::channel(());
            lifecycle.running = true;
            lifecycle.cancel = CancellationToken::new();
            lifecycle.exited = Some(exit_rx);
            (lifecycle.cancel.clone(), exit_tx)
        };
        let _guard = RunGuard {
            inner: Arc::clone(&self.inner),
            _exited: exited,
        };

        self.inner.started.send_replace(true);
        tracing::info!(?interval, "Poll loop started");

        loop {
            self.poll_cycle(&cancel).await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("Poll loop stopped");
        Ok(())
    }

    /// Stops the poll loop and forgets every root and stored entry.
    ///
    /// Waits until the loop has exited, including when several callers
    /// close concurrently. Does nothing if the watcher is not running.
    pub async fn close(&self) {
        let exited = {
            let lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.running {
                return;
            }
            self.inner.watch_set.reset(&lifecycle.cancel);
            lifecycle.exited.clone()
        };
        if let Some(mut exited) = exited {
            // The loop never sends; `changed` fails once the sender is dropped on exit.
            while exited.changed().await.is_ok() {}
            tracing::debug!("Watcher closed");
        }
    }

    /// Waits until the poll loop has been started at least once.
    pub async fn wait(&self) {
        let mut started = self.inner.started.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = started.wait_for(|started| *started).await;
    }

    /// Pushes a synthetic event straight onto the event queue.
    ///
    /// Waits for the watcher to be started first. Without a `record`, a
    /// placeholder named `triggered event` and stamped with the current time
    /// is attached. The event path is always `-`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::ChannelClosed`] if the event stream was dropped.
    pub async fn trigger_event(&self, op: Op, record: Option<FileRecord>) -> Result<(), WatchError> {
        self.wait().await;
        let event = Event {
            op,
            path: Utf8PathBuf::from(TRIGGERED_EVENT_PATH),
            old_path: None,
            record: record.unwrap_or_else(FileRecord::placeholder),
        };
        self.inner
            .event_tx
            .send(event)
            .await
            .map_err(|_| WatchError::ChannelClosed)
    }

    async fn poll_cycle(&self, cancel: &CancellationToken) {
        let started = Instant::now();
        let capture = self.inner.watch_set.capture();
        let mut previous = capture.files;

        let mut listings = JoinSet::new();
        for root in &capture.roots {
            let root = root.clone();
            let filter = capture.filter.clone();
            listings.spawn_blocking(move || {
                let result = snapshot::build(&root.path, root.recursive, &filter);
                (root, result)
            });
        }

        let mut current = Snapshot::default();
        let mut failures = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                joined = listings.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (root, result) = match joined {
                Ok(listing) => listing,
                Err(err) => {
                    tracing::error!(error = %err, "Listing task failed, skipping cycle");
                    return;
                }
            };
            match result {
                Ok(snapshot) => current.extend(snapshot),
                Err(WatchError::NotFound(_)) => {
                    tracing::warn!(path = %root.path, "Watched path deleted");
                    self.inner.watch_set.deregister(&root);
                    previous.retain(|path, _| !root.covers(path));
                    failures.push(WatchError::WatchedPathDeleted(root.path));
                }
                Err(err) => {
                    tracing::warn!(path = %root.path, error = %err, "Listing failed, keeping previous entries");
                    current.extend(
                        previous
                            .iter()
                            .filter(|(path, _)| root.covers(path))
                            .map(|(path, record)| (path.clone(), record.clone())),
                    );
                    failures.push(err);
                }
            }
        }

        for error in failures {
            if !self.report(error, cancel).await {
                return;
            }
        }

        let events = diff(&previous, &current);
        let mut stats = CycleStats::new(events.len());
        let mut pending = events.into_iter();
        while let Some(event) = pending.next() {
            if !capture.policy.allows(event.op) {
                tracing::trace!(op = %event.op, path = %event.path, "Event filtered by op");
                stats.filtered += 1;
                continue;
            }
            if capture.policy.exhausted(stats.forwarded) {
                stats.capped = 1 + pending.len();
                break;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                sent = self.inner.event_tx.send(event) => {
                    if sent.is_ok() {
                        stats.forwarded += 1;
                    }
                }
            }
        }

        if !self
            .inner
            .watch_set
            .commit(current, &capture.roots, capture.generation, cancel)
        {
            return;
        }

        tracing::debug!(
            roots = capture.roots.len(),
            detected = stats.detected,
            forwarded = stats.forwarded,
            filtered = stats.filtered,
            capped = stats.capped,
            elapsed = ?started.elapsed(),
            "Poll cycle complete"
        );
    }

    /// Sends `error` on the error queue. Returns `false` if cancelled first.
    async fn report(&self, error: WatchError, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            sent = self.inner.error_tx.send(error) => {
                if sent.is_err() {
                    tracing::trace!("Error receiver dropped");
                }
                true
            }
        }
    }
}

/// The receiving end of a watcher's event and error queues.
///
/// Both queues close once every [`Watcher`] handle has been dropped.
#[derive(Debug)]
pub struct EventStream {
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<WatchError>,
}

impl EventStream {
    /// Receives the next event.
    ///
    /// Returns `None` once every watcher handle is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Receives the next error reported by the poll loop.
    pub async fn recv_error(&mut self) -> Option<WatchError> {
        self.errors.recv().await
    }

    /// Tries to receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.events.try_recv()
    }

    /// Tries to receive an error without waiting.
    pub fn try_recv_error(&mut self) -> Result<WatchError, mpsc::error::TryRecvError> {
        self.errors.try_recv()
    }

    /// Returns the event receiver, for use with `tokio::select!`.
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    /// Returns the error receiver, for use with `tokio::select!`.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<WatchError> {
        &mut self.errors
    }

    /// Splits the stream into its event and error receivers.
    #[must_use]
    pub fn split(self) -> (mpsc::Receiver<Event>, mpsc::Receiver<WatchError>) {
        (self.events, self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(20);
    const LIMIT: Duration = Duration::from_secs(5);

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().join("w")).expect("utf-8 temp dir");
        fs::create_dir(&root).expect("create root");
        (dir, root)
    }

    fn spawn_loop(watcher: &Watcher) -> tokio::task::JoinHandle<Result<(), WatchError>> {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.start(TICK).await })
    }

    #[tokio::test]
    async fn test_start_rejects_zero_interval() {
        let (watcher, _stream) = Watcher::new();
        let err = watcher.start(Duration::ZERO).await.expect_err("zero interval");
        assert!(matches!(err, WatchError::InvalidInterval(_)));
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (watcher, _stream) = Watcher::new();
        let handle = spawn_loop(&watcher);
        timeout(LIMIT, watcher.wait()).await.expect("started");

        let err = watcher.start(TICK).await.expect_err("already running");
        assert!(err.is_contract_violation());
        assert!(watcher.is_running());

        timeout(LIMIT, watcher.close()).await.expect("closed");
        let result = timeout(LIMIT, handle).await.expect("joined").expect("no panic");
        assert!(result.is_ok());
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_clears_roots() {
        let (_dir, root) = temp_root();
        let (watcher, _stream) = Watcher::new();
        watcher.close().await;

        watcher.add_recursive(&root).expect("add");
        let handle = spawn_loop(&watcher);
        timeout(LIMIT, watcher.wait()).await.expect("started");

        timeout(LIMIT, watcher.close()).await.expect("closed");
        timeout(LIMIT, watcher.close()).await.expect("closed twice");
        assert!(watcher.watched_roots().is_empty());
        assert!(watcher.watched_files().is_empty());
        handle.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_closes_all_wait_for_exit() {
        let (_dir, root) = temp_root();
        let (watcher, _stream) = Watcher::new();
        watcher.add_recursive(&root).expect("add");
        let handle = spawn_loop(&watcher);
        timeout(LIMIT, watcher.wait()).await.expect("started");

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let watcher = watcher.clone();
                tokio::spawn(async move {
                    watcher.close().await;
                    watcher.is_running()
                })
            })
            .collect();
        for closer in closers {
            let running = timeout(LIMIT, closer).await.expect("closed").expect("no panic");
            assert!(!running, "close returned before the loop exited");
        }
        handle.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test]
    async fn test_restart_after_close() {
        let (watcher, _stream) = Watcher::new();
        let first = spawn_loop(&watcher);
        timeout(LIMIT, watcher.wait()).await.expect("started");
        timeout(LIMIT, watcher.close()).await.expect("closed");
        first.await.expect("no panic").expect("clean exit");

        let second = spawn_loop(&watcher);
        timeout(LIMIT, async {
            while !watcher.is_running() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .expect("running again");
        timeout(LIMIT, watcher.close()).await.expect("closed");
        second.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test]
    async fn test_close_does_not_deadlock_on_full_queue() {
        let (_dir, root) = temp_root();
        let (watcher, _stream) = Watcher::with_capacity(1, 1);
        watcher.add_recursive(&root).expect("add");
        for i in 0..5 {
            fs::write(root.join(format!("f{i}")), b"data").expect("write");
        }

        let handle = spawn_loop(&watcher);
        timeout(LIMIT, watcher.wait()).await.expect("started");
        tokio::time::sleep(TICK * 3).await;

        timeout(LIMIT, watcher.close()).await.expect("close with a full queue");
        handle.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test]
    async fn test_trigger_event_waits_for_start() {
        let (watcher, mut stream) = Watcher::new();
        let trigger = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.trigger_event(Op::Chmod, None).await })
        };
        tokio::time::sleep(TICK).await;
        assert!(stream.try_recv().is_err());

        let handle = spawn_loop(&watcher);
        timeout(LIMIT, trigger).await.expect("triggered").expect("no panic").expect("sent");

        let event = timeout(LIMIT, stream.recv()).await.expect("event").expect("open");
        assert_eq!(event.op, Op::Chmod);
        assert_eq!(event.path.as_str(), TRIGGERED_EVENT_PATH);
        assert_eq!(event.record.name(), crate::record::TRIGGERED_EVENT_NAME);

        timeout(LIMIT, watcher.close()).await.expect("closed");
        handle.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test]
    async fn test_trigger_event_after_stream_dropped() {
        let (watcher, stream) = Watcher::new();
        drop(stream);
        let handle = spawn_loop(&watcher);
        let err = timeout(LIMIT, watcher.trigger_event(Op::Write, None))
            .await
            .expect("trigger finished")
            .expect_err("stream dropped");
        assert!(matches!(err, WatchError::ChannelClosed));
        timeout(LIMIT, watcher.close()).await.expect("closed");
        handle.await.expect("no panic").expect("clean exit");
    }

    #[tokio::test]
    async fn test_from_config() {
        let (dir, _root) = temp_root();
        let ignored = Utf8PathBuf::try_from(dir.path().join("w/target")).expect("utf-8");
        let config = WatchConfig {
            max_events: 3,
            ops: vec![Op::Create],
            ignore: vec![ignored.clone()],
            ..WatchConfig::default()
        };
        let (watcher, _stream) = Watcher::from_config(&config).expect("valid config");
        assert!(!watcher.is_running());

        watcher.add(&ignored).expect("add ignored");
        assert!(watcher.watched_roots().is_empty());

        let invalid = WatchConfig {
            poll_interval_ms: 0,
            ..WatchConfig::default()
        };
        let err = Watcher::from_config(&invalid).expect_err("invalid config");
        assert!(matches!(err, WatchError::Config(_)));
    }
}
