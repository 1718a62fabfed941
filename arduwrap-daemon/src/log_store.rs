//! Captured device output: a bounded in-memory ring plus the optional
//! persistent series.
//!
//! The monitor appends from its own task while socket handlers snapshot and
//! clear, so every operation takes the one lock around [`StoreState`].

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use arduwrap_core::DaemonConfig;

use crate::error::{io_err, DaemonError};
use crate::persistent_log::PersistentLog;

#[derive(Debug)]
struct StoreState {
    ring: VecDeque<u8>,
    capacity: usize,
    persistent: Option<PersistentLog>,
}

#[derive(Debug)]
pub struct LogStore {
    state: Mutex<StoreState>,
}

impl LogStore {
    /// Memory-only store keeping at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                ring: VecDeque::with_capacity(capacity.min(64 * 1024)),
                capacity: capacity.max(1),
                persistent: None,
            }),
        }
    }

    /// Store that also appends everything to a rotated file series in `dir`.
    pub fn with_persistent(capacity: usize, dir: &Path, rotate_bytes: u64) -> io::Result<Self> {
        let store = Self::new(capacity);
        store.lock().persistent = Some(PersistentLog::new(dir, rotate_bytes)?);
        Ok(store)
    }

    pub fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        match &config.log_dir {
            Some(dir) => Self::with_persistent(config.buffer_bytes, dir, config.rotate_bytes)
                .map_err(|e| io_err(dir, e)),
            None => Ok(Self::new(config.buffer_bytes)),
        }
    }

    /// Append device output, evicting the oldest bytes past capacity.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.lock();
        let capacity = state.capacity;
        if bytes.len() >= capacity {
            state.ring.clear();
            state.ring.extend(&bytes[bytes.len() - capacity..]);
        } else {
            state.ring.extend(bytes);
            let excess = state.ring.len().saturating_sub(capacity);
            state.ring.drain(..excess);
        }

        if let Some(persistent) = state.persistent.as_mut() {
            if let Err(err) = persistent.append(bytes) {
                tracing::warn!(error = %err, "failed to append to persistent log");
            }
        }
    }

    /// Copy of the ring buffer contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.lock();
        let (front, back) = state.ring.as_slices();
        let mut copy = Vec::with_capacity(front.len() + back.len());
        copy.extend_from_slice(front);
        copy.extend_from_slice(back);
        copy
    }

    /// Snapshot and clear in one step, so nothing appended in between is lost.
    pub fn take_snapshot(&self) -> Vec<u8> {
        let mut state = self.lock();
        let taken: Vec<u8> = state.ring.drain(..).collect();
        taken
    }

    /// Empty the ring buffer. Persistent files are left alone.
    pub fn clear(&self) {
        self.lock().ring.clear();
    }

    /// Timestamped lifecycle line, persistent series only.
    pub fn write_marker(&self, message: &str) {
        if let Some(persistent) = self.lock().persistent.as_mut() {
            if let Err(err) = persistent.write_marker(message) {
                tracing::warn!(error = %err, "failed to write log marker");
            }
        }
    }

    /// Begin a new file in the persistent series (monitor start/restart).
    pub fn start_series(&self) {
        if let Some(persistent) = self.lock().persistent.as_mut() {
            match persistent.start_series() {
                Ok(()) => {
                    if let Some(path) = persistent.current_path() {
                        tracing::info!(path = %path.display(), "persistent serial log");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to start persistent log"),
            }
        }
    }

    /// Flush and close the persistent file.
    pub fn close(&self) {
        if let Some(persistent) = self.lock().persistent.as_mut() {
            if let Err(err) = persistent.close() {
                tracing::warn!(error = %err, "failed to close persistent log");
            }
        }
    }

    pub fn persistent_path(&self) -> Option<PathBuf> {
        self.lock()
            .persistent
            .as_ref()
            .and_then(PersistentLog::current_path)
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
