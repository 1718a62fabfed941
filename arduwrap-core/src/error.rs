//! Error types for arduwrap-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure while reading the config file.
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.arduwrap/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("serial port is required (pass --port or set `port` in the config file)")]
    MissingPort,

    #[error("baud rate must be greater than zero")]
    InvalidBaud,

    #[error("log buffer size must be greater than zero")]
    EmptyBuffer,

    #[error("reset marker must not be empty")]
    EmptyResetMarker,
}
