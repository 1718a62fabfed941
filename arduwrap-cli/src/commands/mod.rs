pub mod compile;
pub mod log;
pub mod serve;
pub mod stop;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;

use arduwrap_core::{config, DaemonConfig};
use arduwrap_daemon::DaemonError;

/// Home, config and resolved socket shared by every subcommand.
#[derive(Debug)]
pub struct ClientContext {
    pub home: PathBuf,
    pub config: DaemonConfig,
    pub socket: PathBuf,
}

impl ClientContext {
    /// `--socket` wins over the config file, which wins over the default.
    pub fn load(socket_override: Option<PathBuf>) -> Result<Self> {
        let home = config::home().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load arduwrap config")?;
        let socket = socket_override.unwrap_or_else(|| config.socket_path(&home));
        Ok(Self {
            home,
            config,
            socket,
        })
    }

    /// Turn a daemon client error into a user-facing one, with a start hint
    /// when nothing is listening.
    pub fn daemon_error(&self, err: DaemonError, action: &str) -> anyhow::Error {
        match err {
            DaemonError::DaemonNotRunning { .. } => anyhow!(
                "{}\n{} {}",
                format!("daemon is not running (no socket at {})", self.socket.display()).red(),
                "Start server with:".bold(),
                self.start_hint()
            ),
            other => anyhow::Error::new(other).context(action.to_string()),
        }
    }

    fn start_hint(&self) -> String {
        let port = if self.config.port.is_empty() {
            "<port>".to_string()
        } else {
            self.config.port.clone()
        };
        let baud = match self.config.baud {
            0 => "<baud>".to_string(),
            baud => baud.to_string(),
        };
        format!("arduwrap serve --port {port} --baud {baud}")
    }
}
