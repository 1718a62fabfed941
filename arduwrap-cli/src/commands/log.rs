//! `arduwrap log`: captured serial output, from the daemon or from disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use regex::{Regex, RegexBuilder};

use arduwrap_core::paths;
use arduwrap_daemon::{latest_log_file, request_log};

use super::ClientContext;

#[derive(Args, Debug, Default)]
pub struct LogArgs {
    /// Clear the daemon's buffer after reading it.
    #[arg(long, short = 'c', conflicts_with = "file")]
    pub clear: bool,

    /// Only show lines matching this regex.
    #[arg(long, short = 'f', value_name = "PATTERN")]
    pub filter: Option<String>,

    /// Case-insensitive --filter matching.
    #[arg(long, short = 'i')]
    pub ignore_case: bool,

    /// Only show the last N lines.
    #[arg(long, short = 'n', value_name = "N")]
    pub lines: Option<usize>,

    /// Read the newest persistent log file instead of the daemon buffer.
    #[arg(long)]
    pub file: bool,

    /// Directory holding the persistent logs (same as `serve --log-dir`).
    #[arg(long, value_name = "DIR", requires = "file")]
    pub log_dir: Option<PathBuf>,
}

impl LogArgs {
    pub fn run(self, context: &ClientContext) -> Result<()> {
        // Compile first so a bad pattern never clears the buffer.
        let pattern = self.pattern()?;

        let text = if self.file {
            read_latest_file(&self.log_dir(context))?
        } else {
            request_log(&context.socket, self.clear)
                .map_err(|err| context.daemon_error(err, "failed to fetch log"))?
        };

        if text.is_empty() {
            eprintln!("(no log data)");
            return Ok(());
        }

        let selected = select_lines(&text, pattern.as_ref(), self.lines);
        if selected.is_empty() {
            eprintln!("(no matching lines)");
        } else {
            print!("{}", selected.concat());
        }
        Ok(())
    }

    fn pattern(&self) -> Result<Option<Regex>> {
        self.filter
            .as_deref()
            .map(|filter| {
                RegexBuilder::new(filter)
                    .case_insensitive(self.ignore_case)
                    .build()
                    .with_context(|| format!("invalid regex pattern '{filter}'"))
            })
            .transpose()
    }

    /// `--log-dir`, else the configured directory, else `~/.arduwrap/logs`.
    fn log_dir(&self, context: &ClientContext) -> PathBuf {
        self.log_dir
            .clone()
            .or_else(|| context.config.log_dir.clone())
            .unwrap_or_else(|| paths::logs_dir(&context.home))
    }
}


fn read_latest_file(dir: &Path) -> Result<String> {
    let Some(path) = latest_log_file(dir)
        .with_context(|| format!("failed to list log files in {}", dir.display()))?
    else {
        bail!("no persistent log files in {}", dir.display());
    };
    let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Lines (terminators kept) that match `pattern`, limited to the last `tail`.
fn select_lines<'a>(text: &'a str, pattern: Option<&Regex>, tail: Option<usize>) -> Vec<&'a str> {
    let mut lines: Vec<&str> = text
        .split_inclusive('\n')
        .filter(|line| pattern.map_or(true, |re| re.is_match(line)))
        .collect();
    if let Some(n) = tail.filter(|&n| n > 0) {
        if lines.len() > n {
            lines.drain(..lines.len() - n);
        }
    }
    lines
}
