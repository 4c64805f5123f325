//! Core types, configuration, and errors for the pollwatch workspace.
//!
//! This crate provides the foundational pieces shared by the watcher library
//! and the command-line front end:
//!
//! - [`Op`]: the change classification carried by every watch event
//! - Configuration structures ([`Config`], [`WatchConfig`], [`LogConfig`])
//! - [`ConfigError`] for configuration loading and validation failures
//!
//! # Examples
//!
//! ```
//! use pw_core::{Config, Op};
//!
//! let config = Config::from_json_str(r#"{"watch": {"ops": ["create", "remove"]}}"#)?;
//! assert_eq!(config.watch.ops, vec![Op::Create, Op::Remove]);
//! # Ok::<(), pw_core::ConfigError>(())
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod op;

pub use config::{Config, LogConfig, WatchConfig};
pub use error::ConfigError;
pub use op::Op;
