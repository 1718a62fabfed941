use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.yaml";
pub const DAEMON_SOCKET: &str = "arduwrap.sock";

pub fn arduwrap_root(home: &Path) -> PathBuf {
    home.join(".arduwrap")
}

pub fn config_path(home: &Path) -> PathBuf {
    arduwrap_root(home).join(CONFIG_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    arduwrap_root(home).join(DAEMON_SOCKET)
}

/// Suggested location for persistent serial logs; only used when the
/// operator opts in without naming a directory.
pub fn logs_dir(home: &Path) -> PathBuf {
    arduwrap_root(home).join("logs")
}
