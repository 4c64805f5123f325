//! CLI entry point for pollwatch.
//!
//! This binary watches files and directory trees by polling and prints every
//! change it observes until interrupted.
//!
//! # Usage
//!
//! ```bash
//! pollwatch [OPTIONS] [PATHS]...
//!
//! # Watch the current directory tree
//! pollwatch -r
//!
//! # Only creations and removals, as JSON lines, polling every 500ms
//! pollwatch ./src --ops create,remove --format json --interval 500
//!
//! # Load settings from a file, then override the hidden-file rule
//! pollwatch --config pollwatch.json --ignore-hidden
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use color_eyre::eyre::WrapErr;
use pw_core::{Config, Op};
use pw_watcher::{Dispatcher, Event, Watcher};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Watch files and directories for changes by polling.
///
/// Every interval the watched paths are listed again and compared against the
/// previous listing. Renames and moves are recognised from file identity.
#[derive(Debug, Parser)]
#[command(name = "pollwatch", version, about, long_about = None)]
struct Cli {
    /// Files or directories to watch.
    #[arg(env = "POLLWATCH_PATH", value_delimiter = ',', default_value = ".")]
    paths: Vec<Utf8PathBuf>,

    /// Watch directories recursively.
    ///
    /// Defaults to the configuration file setting (recursive unless
    /// disabled). Pass `--recursive=false` to watch one level deep.
    #[arg(
        short,
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    recursive: Option<bool>,

    /// Time between two polls, in milliseconds.
    #[arg(short, long, value_name = "MS")]
    interval: Option<u64>,

    /// Path to exclude from watching (repeatable).
    #[arg(long = "ignore", value_name = "PATH")]
    ignore: Vec<Utf8PathBuf>,

    /// Skip hidden files and directories.
    #[arg(long)]
    ignore_hidden: bool,

    /// Maximum number of events reported per poll (0 = unlimited).
    #[arg(long, value_name = "N")]
    max_events: Option<usize>,

    /// Only report these operations (comma separated).
    #[arg(long, value_delimiter = ',', value_name = "OP,...")]
    ops: Vec<Op>,

    /// JSON configuration file.
    #[arg(short, long, env = "POLLWATCH_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,

    /// Event output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Event output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One human-readable line per event.
    Text,
    /// One JSON object per line.
    Json,
}

/// JSON shape of one printed event.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    op: Op,
    path: &'a Utf8Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_path: Option<&'a Utf8Path>,
    dir: bool,
    size: u64,
}

impl<'a> From<&'a Event> for EventLine<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            op: event.op,
            path: &event.path,
            old_path: event.old_path(),
            dir: event.record.is_dir(),
            size: event.record.size(),
        }
    }
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise uses
/// `level`, with `mio` filtered to `warn`. Colors are disabled when `ansi`
/// is false or `NO_COLOR` is set.
fn init_tracing(level: &str, ansi: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},mio=warn")));

    let use_ansi = ansi && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_ansi(use_ansi).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Builds a [`Config`] from the optional configuration file and CLI overrides.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be loaded or the merged
/// settings are invalid.
fn build_config(cli: &Cli) -> color_eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("Failed to load configuration from {path}"))?,
        None => Config::default(),
    };

    let watch = &mut config.watch;
    if let Some(recursive) = cli.recursive {
        watch.recursive = recursive;
    }
    if let Some(interval) = cli.interval {
        watch.poll_interval_ms = interval;
    }
    if let Some(max_events) = cli.max_events {
        watch.max_events = max_events;
    }
    if !cli.ops.is_empty() {
        watch.ops.clone_from(&cli.ops);
    }
    watch.ignore_hidden |= cli.ignore_hidden;
    watch.ignore.extend(cli.ignore.iter().cloned());
    watch.validate()?;

    if cli.verbose {
        "debug".clone_into(&mut config.log.level);
    }
    config.log.ansi &= !cli.no_color;

    Ok(config)
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Renders one event as a single output line.
fn render(event: &Event, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Text => Ok(event.to_string()),
        OutputFormat::Json => serde_json::to_string(&EventLine::from(event)),
    }
}

/// Returns a handler printing every event to stdout.
fn printer(format: OutputFormat) -> impl Fn(&Event) + Send + Sync + 'static {
    move |event: &Event| {
        let line = match render(event, format) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, path = %event.path, "Failed to serialize event");
                return;
            }
        };
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        if let Err(err) = writeln!(handle, "{line}") {
            warn!(error = %err, "Failed to write event");
        }
    }
}

// =============================================================================
// COMMAND IMPLEMENTATION
// =============================================================================

/// Resolves once Ctrl-C, or SIGTERM on Unix, is received.
async fn shutdown_signal() -> color_eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl-C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C, shutting down");
    }

    Ok(())
}

/// Watches the configured paths until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if a path cannot be watched or the poll loop fails.
async fn run_watch(
    config: &Config,
    paths: &[Utf8PathBuf],
    format: OutputFormat,
) -> color_eyre::Result<()> {
    let (watcher, stream) = Watcher::from_config(&config.watch)?;

    for path in paths {
        let added = if config.watch.recursive {
            watcher.add_recursive(path)
        } else {
            watcher.add(path)
        };
        added.wrap_err_with(|| format!("Cannot watch {path}"))?;
    }

    let dispatcher = tokio::spawn(Dispatcher::new().with_handler(printer(format)).run(stream));

    let interval: Duration = config.watch.poll_interval();
    let poller = watcher.clone();
    let mut poll_loop = tokio::spawn(async move { poller.start(interval).await });

    watcher.wait().await;
    info!(
        roots = watcher.watched_roots().len(),
        files = watcher.watched_files().len(),
        recursive = config.watch.recursive,
        "Watching"
    );

    let finished_early = tokio::select! {
        result = shutdown_signal() => {
            result?;
            None
        }
        joined = &mut poll_loop => Some(joined),
    };

    watcher.close().await;
    let joined = match finished_early {
        Some(joined) => joined,
        None => poll_loop.await,
    };
    joined??;

    // The dispatcher drains until every watcher handle is gone.
    drop(watcher);
    let stats = dispatcher.await?;
    info!(
        events = stats.events,
        errors = stats.errors,
        "Stopped watching"
    );

    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments and merge them over the configuration file
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(&config.log.level, config.log.ansi);

    run_watch(&config, &cli.paths, cli.format).await
}
