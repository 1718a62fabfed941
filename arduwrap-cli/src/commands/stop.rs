//! `arduwrap stop`

use anyhow::Result;
use colored::Colorize;

use arduwrap_daemon::{request_stop, DaemonError};

use super::ClientContext;

pub fn run(context: &ClientContext) -> Result<()> {
    match request_stop(&context.socket) {
        Ok(()) => println!("{} daemon stop requested", "✓".green()),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(context.daemon_error(err, "failed to stop daemon")),
    }
    Ok(())
}
