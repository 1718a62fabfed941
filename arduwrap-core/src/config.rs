//! Daemon configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.arduwrap/
//!   config.yaml     (optional; every field has a default)
//!   arduwrap.sock   (rendezvous endpoint while `serve` runs)
//! ```
//!
//! `serve` loads the file first and then applies its command-line flags on
//! top, so flags always win. [`DaemonConfig::validate`] runs after both.
//!
//! # API pattern
//!
//! - `load_at(home: &Path)`: explicit home; used in tests with `TempDir`
//! - `load()`: derives home from `dirs::home_dir()`, delegates to `load_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

/// Ring buffer capacity when nothing else is configured (512 KiB).
pub const DEFAULT_BUFFER_BYTES: usize = 512 * 1024;

/// Persistent log rotation threshold (50 MiB).
pub const DEFAULT_ROTATE_BYTES: u64 = 50 * 1024 * 1024;

/// Line printed by `arduino-cli` (esptool) right after it pulses RTS.
pub const DEFAULT_RESET_MARKER: &str = "Hard resetting via RTS pin";

pub const DEFAULT_TOOL: &str = "arduino-cli";

/// How long the daemon waits for a client to finish sending its request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Serial device path, e.g. `/dev/cu.usbmodem1101`.
    pub port: String,
    pub baud: u32,
    /// Rendezvous socket; `None` means `~/.arduwrap/arduwrap.sock`.
    pub socket: Option<PathBuf>,
    /// Directory for the persistent log series; `None` disables it.
    pub log_dir: Option<PathBuf>,
    /// Bytes per persistent log file before rotating; `0` disables rotation.
    pub rotate_bytes: u64,
    pub buffer_bytes: usize,
    /// A client that has not sent a complete request by then gets an error.
    pub request_timeout_ms: u64,
    pub reset_marker: String,
    pub tool: ToolConfig,
    pub timing: MonitorTiming,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: 0,
            socket: None,
            log_dir: None,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reset_marker: DEFAULT_RESET_MARKER.to_string(),
            tool: ToolConfig::default(),
            timing: MonitorTiming::default(),
        }
    }
}

impl DaemonConfig {
    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::MissingPort);
        }
        if self.baud == 0 {
            return Err(ConfigError::InvalidBaud);
        }
        if self.buffer_bytes == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        if self.reset_marker.is_empty() {
            return Err(ConfigError::EmptyResetMarker);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// Socket path to bind or connect to, falling back to the home layout.
    pub fn socket_path(&self, home: &Path) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| paths::socket_path(home))
    }
}

/// How the external build/flash tool is invoked.
///
/// The final command line is
/// `<program> [--config-file <config_file>] <leading_args…> -p <port> <args…>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub program: String,
    pub leading_args: Vec<String>,
    /// Only passed when the file exists at spawn time.
    pub config_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_TOOL.to_string(),
            leading_args: vec!["compile".to_string()],
            config_file: None,
            working_dir: None,
        }
    }
}

/// Monitor loop cadences, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorTiming {
    /// Minimum gap between open attempts while disconnected.
    pub reconnect_ms: u64,
    /// Gap between open attempts right after a resume.
    pub fast_reconnect_ms: u64,
    pub paused_poll_ms: u64,
    /// Sleep when connected but no bytes are waiting.
    pub idle_ms: u64,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            reconnect_ms: 500,
            fast_reconnect_ms: 50,
            paused_poll_ms: 100,
            idle_ms: 10,
        }
    }
}

impl MonitorTiming {
    pub fn reconnect_interval(&self, eager: bool) -> Duration {
        if eager {
            Duration::from_millis(self.fast_reconnect_ms)
        } else {
            Duration::from_millis(self.reconnect_ms)
        }
    }

    pub fn paused_poll(&self) -> Duration {
        Duration::from_millis(self.paused_poll_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Sleep between loop turns while waiting to reconnect. Never longer
    /// than the fast interval so an eager reconnect is not delayed.
    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.fast_reconnect_ms.clamp(1, 20))
    }
}

/// Load `<home>/.arduwrap/config.yaml`, or defaults when the file is absent.
///
/// Returns `ConfigError::Parse` (with path + line context) if malformed YAML.
/// The result is not validated; callers apply overrides first.
pub fn load_at(home: &Path) -> Result<DaemonConfig, ConfigError> {
    let path = paths::config_path(home);
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(DaemonConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<DaemonConfig, ConfigError> {
    load_at(&home()?)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
