//! Size-rotated, append-only serial log files.
//!
//! One series per monitor start, named by its creation time. When the open
//! file would grow past the threshold the series continues in a numbered
//! file:
//!   serial-20261019-101500.log → serial-20261019-101500.1.log → …
//!
//! Nothing is ever deleted or truncated here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

pub const FILE_PREFIX: &str = "serial-";
pub const FILE_SUFFIX: &str = ".log";
pub const MARKER_PREFIX: &str = "[arduwrap]";

#[derive(Debug)]
pub struct PersistentLog {
    dir: PathBuf,
    /// Rotation threshold in bytes; 0 disables rotation.
    threshold: u64,
    stamp: String,
    index: u32,
    file: Option<File>,
    size: u64,
    at_line_start: bool,
}

impl PersistentLog {
    /// Prepare `dir` for logging. No file is created until the first write
    /// or [`PersistentLog::start_series`].
    pub fn new(dir: impl Into<PathBuf>, threshold: u64) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            threshold,
            stamp: String::new(),
            index: 0,
            file: None,
            size: 0,
            at_line_start: true,
        })
    }

    /// Close the current file (if any) and begin a new series.
    pub fn start_series(&mut self) -> io::Result<()> {
        self.close()?;
        self.stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        self.index = 0;
        self.open_next()
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write_chunk(bytes)?;
        self.at_line_start = bytes.ends_with(b"\n");
        Ok(())
    }

    /// Append `[arduwrap] <timestamp> <message>` on a line of its own.
    pub fn write_marker(&mut self, message: &str) -> io::Result<()> {
        let lead = if self.at_line_start { "" } else { "\n" };
        let line = format!(
            "{lead}{MARKER_PREFIX} {} {message}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.write_chunk(line.as_bytes())?;
        self.at_line_start = true;
        Ok(())
    }

    /// Flush and close the open file. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|_| self.path_for(self.index))
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            if self.stamp.is_empty() {
                self.stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
            }
            self.open_next()?;
        } else if self.needs_rotation(bytes.len() as u64) {
            self.close()?;
            self.index += 1;
            self.open_next()?;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("persistent log file is not open"));
        };
        if let Err(err) = file.write_all(bytes) {
            // Drop the handle so the next write starts a fresh file.
            self.file = None;
            return Err(err);
        }
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// A chunk larger than the threshold still lands whole in a fresh file.
    fn needs_rotation(&self, incoming: u64) -> bool {
        self.threshold > 0 && self.size > 0 && self.size + incoming > self.threshold
    }

    /// Open the first unused file at or after the current index.
    fn open_next(&mut self) -> io::Result<()> {
        while self.path_for(self.index).exists() {
            self.index += 1;
        }
        let path = self.path_for(self.index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "opened persistent log file");
        self.file = Some(file);
        self.size = 0;
        self.at_line_start = true;
        Ok(())
    }

    fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(series_file_name(&self.stamp, index))
    }
}

impl Drop for PersistentLog {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close persistent log");
        }
    }
}

/// `serial-<stamp>.log` for index 0, `serial-<stamp>.<index>.log` after.
pub fn series_file_name(stamp: &str, index: u32) -> String {
    if index == 0 {
        format!("{FILE_PREFIX}{stamp}{FILE_SUFFIX}")
    } else {
        format!("{FILE_PREFIX}{stamp}.{index}{FILE_SUFFIX}")
    }
}

/// Inverse of [`series_file_name`].
pub fn parse_series_file_name(name: &str) -> Option<(String, u32)> {
    let body = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    match body.split_once('.') {
        None => Some((body.to_string(), 0)),
        Some((stamp, index)) => Some((stamp.to_string(), index.parse().ok()?)),
    }
}

/// All series files under `dir`, oldest first.
pub fn list_log_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<((String, u32), PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let key = parse_series_file_name(&name.to_string_lossy())?;
            Some((key, entry.path()))
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// The file most recently written by the daemon, if any.
pub fn latest_log_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    Ok(list_log_files(dir)?.pop())
}
