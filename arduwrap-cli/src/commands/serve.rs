//! `arduwrap serve`: run the monitor daemon in the foreground.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use arduwrap_core::{paths, DaemonConfig};
use arduwrap_daemon::start_blocking;

use super::ClientContext;

/// Flags override `~/.arduwrap/config.yaml`.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Serial port to monitor (e.g. /dev/cu.usbmodem1101).
    #[arg(long, short = 'p')]
    pub port: Option<String>,

    /// Baud rate (e.g. 115200).
    #[arg(long, short = 'b')]
    pub baud: Option<u32>,

    /// Also write everything to a rotated log series in this directory.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Persist to ~/.arduwrap/logs unless --log-dir or the config names a directory.
    #[arg(long, conflicts_with = "log_dir")]
    pub persist: bool,

    /// Rotate persistent log files past this many bytes (0 disables).
    #[arg(long, value_name = "BYTES")]
    pub rotate_bytes: Option<u64>,

    /// In-memory log buffer size.
    #[arg(long, value_name = "BYTES")]
    pub buffer_bytes: Option<usize>,

    /// Tool output line that means the board was just reset.
    #[arg(long, value_name = "TEXT")]
    pub reset_marker: Option<String>,

    /// Build/flash program to run for `compile`.
    #[arg(long, value_name = "PROGRAM")]
    pub tool: Option<String>,
}

impl ServeArgs {
    pub fn run(self, context: ClientContext) -> Result<()> {
        let ClientContext {
            home,
            config,
            socket,
        } = context;
        let mut config = self.apply(config, &home);
        config.socket = Some(socket);
        config
            .validate()
            .context("invalid daemon configuration (see `arduwrap serve --help`)")?;

        start_blocking(&config, &home).context("daemon exited with error")?;
        Ok(())
    }

    fn apply(self, mut config: DaemonConfig, home: &Path) -> DaemonConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(baud) = self.baud {
            config.baud = baud;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        } else if self.persist && config.log_dir.is_none() {
            config.log_dir = Some(paths::logs_dir(home));
        }
        if let Some(bytes) = self.rotate_bytes {
            config.rotate_bytes = bytes;
        }
        if let Some(bytes) = self.buffer_bytes {
            config.buffer_bytes = bytes;
        }
        if let Some(marker) = self.reset_marker {
            config.reset_marker = marker;
        }
        if let Some(program) = self.tool {
            config.tool.program = program;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let file = DaemonConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            buffer_bytes: 4096,
            ..DaemonConfig::default()
        };
        let args = ServeArgs {
            baud: Some(115_200),
            tool: Some("/opt/arduino-cli".to_string()),
            ..ServeArgs::default()
        };

        let config = args.apply(file, Path::new("/home/dev"));
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.buffer_bytes, 4096);
        assert_eq!(config.tool.program, "/opt/arduino-cli");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn persist_uses_home_logs_dir_only_when_unset() {
        let home = Path::new("/home/dev");
        let args = ServeArgs {
            persist: true,
            ..ServeArgs::default()
        };
        let config = args.apply(DaemonConfig::default(), home);
        assert_eq!(config.log_dir, Some(home.join(".arduwrap/logs")));

        let args = ServeArgs {
            persist: true,
            ..ServeArgs::default()
        };
        let configured = DaemonConfig {
            log_dir: Some(PathBuf::from("/var/log/arduwrap")),
            ..DaemonConfig::default()
        };
        let config = args.apply(configured, home);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/arduwrap")));
    }
}
