//! Compile/flash orchestration.
//!
//! The external tool needs the serial port to itself, so a compile holds a
//! [`PauseGuard`] for its whole lifetime. When the tool reports that it just
//! reset the board, the guard is released early so the monitor can race to
//! reattach and capture the boot log.

use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;
use std::sync::Arc;

use arduwrap_core::args::rewrite_port_args;
use arduwrap_core::{DaemonConfig, ToolConfig};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

use crate::log_store::LogStore;
use crate::monitor::Monitor;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("No arguments provided")]
    NoArguments,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    /// Tool exit code; `-1` when it was killed by a signal.
    pub exit_code: i32,
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
    pub reset_detected: bool,
}

impl CompileOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct CompileOrchestrator {
    monitor: Arc<Monitor>,
    store: Arc<LogStore>,
    tool: ToolConfig,
    reset_marker: String,
}

impl CompileOrchestrator {
    pub fn new(
        monitor: Arc<Monitor>,
        store: Arc<LogStore>,
        tool: ToolConfig,
        reset_marker: impl Into<String>,
    ) -> Self {
        Self {
            monitor,
            store,
            tool,
            reset_marker: reset_marker.into(),
        }
    }

    pub fn from_config(config: &DaemonConfig, monitor: Arc<Monitor>, store: Arc<LogStore>) -> Self {
        Self::new(monitor, store, config.tool.clone(), config.reset_marker.clone())
    }

    /// Arguments passed to the tool program for `raw_args`.
    pub fn tool_args(&self, raw_args: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config_file) = &self.tool.config_file {
            if config_file.exists() {
                args.push("--config-file".to_string());
                args.push(config_file.to_string_lossy().into_owned());
            }
        }
        args.extend(self.tool.leading_args.iter().cloned());
        args.extend(rewrite_port_args(raw_args, self.monitor.port()));
        args
    }

    /// Run the tool with the monitor paused; the monitor is resumed on every
    /// exit path.
    pub async fn run(&self, raw_args: &[String]) -> Result<CompileOutcome, CompileError> {
        if raw_args.is_empty() {
            return Err(CompileError::NoArguments);
        }
        let program = self.tool.program.clone();
        let args = self.tool_args(raw_args);

        self.store
            .write_marker(&format!("compile requested: {program} {}", args.join(" ")));
        let mut pause = self.monitor.pause_guard();
        self.store.clear();

        tracing::info!(program = %program, args = ?args, "running external tool");
        let spawned = shared_output().and_then(|(output, stdout, stderr)| {
            let mut command = Command::new(&program);
            command
                .args(&args)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr);
            if let Some(dir) = &self.tool.working_dir {
                command.current_dir(dir);
            }
            // Dropping `command` closes our copies of the write end, so the
            // reader sees EOF once the tool exits.
            command.spawn().map(|child| (child, output))
        });
        let (mut child, output_stream) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                self.store
                    .write_marker(&format!("compile failed to start: {source}"));
                tracing::error!(program = %program, error = %source, "failed to spawn external tool");
                return Err(CompileError::Spawn { program, source });
            }
        };

        let mut output = String::new();
        let mut reset_detected = false;
        let mut reader = BufReader::new(output_stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "failed reading tool output");
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            echo_line(&line);
            if !reset_detected && line.contains(&self.reset_marker) {
                reset_detected = true;
                tracing::info!("device reset detected, resuming monitor");
                pause.resume_now();
            }
            output.push_str(&line);
        }

        let status = child.wait().await.map_err(|source| CompileError::Io {
            program: program.clone(),
            source,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        self.store
            .write_marker(&format!("compile finished (exit code {exit_code})"));
        tracing::info!(exit_code, reset_detected, "external tool finished");
        drop(pause);

        Ok(CompileOutcome {
            exit_code,
            output,
            reset_detected,
        })
    }
}

/// One stream carrying both of the tool's stdout and stderr, so lines keep
/// the order the tool wrote them in. Returns our read end plus the two child
/// handles.
fn shared_output() -> io::Result<(UnixStream, Stdio, Stdio)> {
    let (ours, theirs) = StdUnixStream::pair()?;
    let stderr = theirs.try_clone()?;
    ours.set_nonblocking(true)?;
    let ours = UnixStream::from_std(ours)?;
    Ok((
        ours,
        Stdio::from(OwnedFd::from(theirs)),
        Stdio::from(OwnedFd::from(stderr)),
    ))
}

fn echo_line(line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(line.as_bytes()).and_then(|()| stdout.flush());
}
