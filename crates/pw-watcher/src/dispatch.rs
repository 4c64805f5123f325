//! Fan-out of watcher events to handlers.
//!
//! A [`Dispatcher`] drains an [`EventStream`], passes every event through an
//! optional [`EventHook`] and hands the result to each registered
//! [`EventHandler`]. Errors from the error queue are logged.
//!
//! # Examples
//!
//! ```no_run
//! use pw_watcher::{Dispatcher, Event, Watcher};
//!
//! # async fn example() -> Result<(), pw_watcher::WatchError> {
//! let (watcher, stream) = Watcher::new();
//! watcher.add_recursive("./src")?;
//!
//! let stats = Dispatcher::new()
//!     .with_hook(|event: Event| (event.path.extension() != Some("tmp")).then_some(event))
//!     .with_handler(|event: &Event| println!("{event}"))
//!     .run(stream)
//!     .await;
//! println!("dispatched {} events", stats.events);
//! # Ok(())
//! # }
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use crate::events::Event;
use crate::watcher::EventStream;

/// A consumer of dispatched events.
///
/// Handlers may block; in [`DispatchMode::Concurrent`] each call runs on the
/// blocking thread pool. A panicking handler is logged in either mode and
/// dispatch carries on with the remaining handlers.
pub trait EventHandler: Send + Sync + 'static {
    /// Handles one event.
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn handle(&self, event: &Event) {
        self(event);
    }
}

/// Rewrites or drops events before they reach the handlers.
pub trait EventHook: Send + Sync + 'static {
    /// Returns the event to dispatch, or `None` to skip it.
    fn hook(&self, event: Event) -> Option<Event>;
}

impl<F> EventHook for F
where
    F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
{
    fn hook(&self, event: Event) -> Option<Event> {
        self(event)
    }
}

/// How an event is handed to multiple handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every handler runs on its own blocking task; all are joined before
    /// the next event.
    #[default]
    Concurrent,

    /// Handlers run one after another on the dispatching task.
    Sequential,
}

/// Totals reported when a dispatcher finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events handed to the handlers.
    pub events: usize,
    /// Events dropped by the hook.
    pub skipped: usize,
    /// Errors received from the error queue.
    pub errors: usize,
}

/// Drains an [`EventStream`] into a set of handlers.
#[derive(Default)]
pub struct Dispatcher {
    hook: Option<Arc<dyn EventHook>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    mode: DispatchMode,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("hook", &self.hook.is_some())
            .field("handlers", &self.handlers.len())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with no hook and no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hook, replacing any previous one.
    #[must_use]
    pub fn with_hook(mut self, hook: impl EventHook) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Adds a handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl EventHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Selects the fan-out strategy.
    #[must_use]
    pub const fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Dispatches until both queues of `stream` are closed and drained.
    pub async fn run(self, stream: EventStream) -> DispatchStats {
        let (mut events, mut errors) = stream.split();
        let mut stats = DispatchStats::default();
        let mut events_open = true;
        let mut errors_open = true;

        while events_open || errors_open {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(event, &mut stats).await,
                    None => events_open = false,
                },
                error = errors.recv(), if errors_open => match error {
                    Some(error) => {
                        tracing::error!(error = %error, "Watcher error");
                        stats.errors += 1;
                    }
                    None => errors_open = false,
                },
            }
        }

        tracing::debug!(
            events = stats.events,
            skipped = stats.skipped,
            errors = stats.errors,
            "Dispatcher finished"
        );
        stats
    }

    async fn dispatch(&self, event: Event, stats: &mut DispatchStats) {
        tracing::debug!(%event, "Dispatching event");
        let event = match &self.hook {
            Some(hook) => match hook.hook(event) {
                Some(event) => event,
                None => {
                    tracing::trace!("Event skipped by hook");
                    stats.skipped += 1;
                    return;
                }
            },
            None => event,
        };
        stats.events += 1;

        match self.mode {
            DispatchMode::Sequential => {
                for handler in &self.handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler.handle(&event))).is_err() {
                        tracing::error!(path = %event.path, "Event handler panicked");
                    }
                }
            }
            DispatchMode::Concurrent => {
                let event = Arc::new(event);
                let tasks = self.handlers.iter().map(|handler| {
                    let handler = Arc::clone(handler);
                    let event = Arc::clone(&event);
                    tokio::task::spawn_blocking(move || handler.handle(&event))
                });
                for result in join_all(tasks).await {
                    if let Err(err) = result {
                        tracing::error!(error = %err, "Event handler panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::Watcher;
    use parking_lot::Mutex;
    use pw_core::Op;
    use std::time::Duration;
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    /// Triggers `ops` on a fresh watcher, then closes and drops it so the
    /// returned stream ends after the triggered events.
    async fn triggered_stream(ops: &[Op]) -> EventStream {
        let (watcher, stream) = Watcher::new();
        let poller = watcher.clone();
        let handle = tokio::spawn(async move { poller.start(Duration::from_millis(20)).await });
        for &op in ops {
            timeout(LIMIT, watcher.trigger_event(op, None))
                .await
                .expect("triggered")
                .expect("sent");
        }
        timeout(LIMIT, watcher.close()).await.expect("closed");
        handle.await.expect("no panic").expect("clean exit");
        stream
    }

    #[tokio::test]
    async fn test_fans_out_to_every_handler() {
        let stream = triggered_stream(&[Op::Create, Op::Write]).await;
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let stats = {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            timeout(
                LIMIT,
                Dispatcher::new()
                    .with_handler(move |event: &Event| first.lock().push(event.op))
                    .with_handler(move |event: &Event| second.lock().push(event.op))
                    .run(stream),
            )
            .await
            .expect("dispatcher finished")
        };

        assert_eq!(stats.events, 2);
        assert_eq!(*first.lock(), vec![Op::Create, Op::Write]);
        assert_eq!(*second.lock(), vec![Op::Create, Op::Write]);
    }

    #[tokio::test]
    async fn test_hook_rewrites_and_skips() {
        let stream = triggered_stream(&[Op::Create, Op::Remove, Op::Chmod]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let stats = {
            let seen = Arc::clone(&seen);
            timeout(
                LIMIT,
                Dispatcher::new()
                    .mode(DispatchMode::Sequential)
                    .with_hook(|mut event: Event| {
                        if event.op == Op::Remove {
                            return None;
                        }
                        if event.op == Op::Chmod {
                            event.op = Op::Write;
                        }
                        Some(event)
                    })
                    .with_handler(move |event: &Event| seen.lock().push(event.op))
                    .run(stream),
            )
            .await
            .expect("dispatcher finished")
        };

        assert_eq!(stats.events, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(*seen.lock(), vec![Op::Create, Op::Write]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let stream = triggered_stream(&[Op::Create, Op::Create]).await;
        let count = Arc::new(Mutex::new(0_usize));

        let stats = {
            let count = Arc::clone(&count);
            timeout(
                LIMIT,
                Dispatcher::new()
                    .with_handler(|_: &Event| panic!("handler failure"))
                    .with_handler(move |_: &Event| *count.lock() += 1)
                    .run(stream),
            )
            .await
            .expect("dispatcher finished")
        };

        assert_eq!(stats.events, 2);
        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_in_sequential_mode() {
        let stream = triggered_stream(&[Op::Write, Op::Remove]).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let stats = {
            let seen = Arc::clone(&seen);
            timeout(
                LIMIT,
                Dispatcher::new()
                    .mode(DispatchMode::Sequential)
                    .with_handler(|event: &Event| {
                        if event.op == Op::Write {
                            panic!("handler failure");
                        }
                    })
                    .with_handler(move |event: &Event| seen.lock().push(event.op))
                    .run(stream),
            )
            .await
            .expect("dispatcher finished")
        };

        assert_eq!(stats.events, 2);
        assert_eq!(*seen.lock(), vec![Op::Write, Op::Remove]);
    }
}
