//! Polling filesystem watcher with snapshot diffing.
//!
//! This crate detects filesystem changes by periodically re-listing the
//! watched paths and comparing the result against the previous listing. It
//! needs no kernel notification support, which makes it work the same on
//! network mounts, containers and every platform.
//!
//! # Overview
//!
//! - Watch files or directory trees, recursively or one level deep
//! - Classify changes as `CREATE`, `WRITE`, `CHMOD`, `REMOVE`, `RENAME`, `MOVE`
//! - Infer renames and moves from file identity (device and inode on Unix)
//! - Exclude paths, hidden files, or anything a [`FilterHook`] vetoes
//! - Filter forwarded operations and cap the number of events per cycle
//! - Stream events and errors through bounded tokio queues
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  add / ignore / remove   ┌───────────┐
//! │  Caller  │ ───────────────────────► │ WatchSet  │
//! └──────────┘                          └─────┬─────┘
//!      ▲                          capture     │     ▲ commit
//!      │                                      ▼     │
//!      │   ┌──────────────┐   ┌──────────────────────────────┐
//!      └── │ EventStream  │ ◄─│ Poll loop: snapshot ► diff   │
//!          └──────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! pw-cli ──► pw-watcher ──► pw-core
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use pw_watcher::Watcher;
//! use pw_core::Op;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (watcher, stream) = Watcher::new();
//!     watcher.ignore_hidden_files(true);
//!     watcher.filter_ops([Op::Create, Op::Write, Op::Rename]);
//!     watcher.add_recursive("/tmp/w")?;
//!
//!     let poller = watcher.clone();
//!     tokio::spawn(async move { poller.start(Duration::from_millis(100)).await });
//!
//!     let (mut events, mut errors) = stream.split();
//!     loop {
//!         tokio::select! {
//!             Some(event) = events.recv() => println!("{event}"),
//!             Some(error) = errors.recv() => eprintln!("error: {error}"),
//!             _ = tokio::signal::ctrl_c() => break,
//!         }
//!     }
//!
//!     watcher.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Calls on [`Watcher`] return [`WatchError`] directly. Failures inside the
//! poll loop never stop it; they are sent to the error queue instead:
//!
//! ```
//! use pw_watcher::WatchError;
//!
//! fn handle_poll_error(err: WatchError) {
//!     match err {
//!         WatchError::WatchedPathDeleted(path) => eprintln!("stopped watching {path}"),
//!         other => eprintln!("poll error: {other}"),
//!     }
//! }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod diff;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod filter;
pub mod record;
pub mod snapshot;
pub mod watch_set;
pub mod watcher;

pub use diff::diff;
pub use dispatch::{DispatchMode, DispatchStats, Dispatcher, EventHandler, EventHook};
pub use error::{FilterError, WatchError};
pub use events::{CycleStats, Event};
pub use filter::{ExtensionHook, FilterHook, GlobHook, PathFilter, RegexHook, Verdict};
pub use record::{FileIdentity, FileRecord, Snapshot, TRIGGERED_EVENT_NAME};
pub use watch_set::{WatchRoot, resolve_path};
pub use watcher::{EventStream, TRIGGERED_EVENT_PATH, Watcher};
