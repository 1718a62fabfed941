//! arduwrap core library: configuration, filesystem layout, argument rewriting.
//!
//! - [`config`]: [`DaemonConfig`] and its YAML loader
//! - [`paths`]: `~/.arduwrap/` layout
//! - [`args`]: compile argument rewriting shared by client and daemon
//! - [`error`]: [`ConfigError`]

pub mod args;
pub mod config;
pub mod error;
pub mod paths;

pub use config::{DaemonConfig, MonitorTiming, ToolConfig};
pub use error::ConfigError;
