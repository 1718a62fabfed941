//! In-process simulated serial device.
//!
//! A [`LoopbackLine`] stands in for the physical cable: tests push bytes
//! into it, unplug and replug it, and observe how often the daemon opened
//! it. [`LoopbackOpener`] hands out [`SerialDevice`] handles bound to the
//! line.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::device::{DeviceOpener, SerialDevice};

#[derive(Debug, Default)]
struct LineState {
    present: bool,
    pending: VecDeque<u8>,
    fail_next_read: bool,
    /// Bumped on unplug so handles from before the unplug go stale.
    generation: u64,
    open_handles: usize,
    opened_at: Vec<Instant>,
}

/// Shared handle to one simulated device.
#[derive(Debug, Clone)]
pub struct LoopbackLine {
    state: Arc<Mutex<LineState>>,
}

impl Default for LoopbackLine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLine {
    /// A plugged-in device with an empty output buffer.
    pub fn new() -> Self {
        let line = Self::unplugged();
        line.lock().present = true;
        line
    }

    pub fn unplugged() -> Self {
        Self {
            state: Arc::new(Mutex::new(LineState::default())),
        }
    }

    pub fn opener(&self) -> LoopbackOpener {
        LoopbackOpener { line: self.clone() }
    }

    /// Bytes the "firmware" writes; readable by whoever holds the port.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().pending.extend(bytes.iter().copied());
    }

    /// Simulate USB disappearance: open handles fail, new opens fail.
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.present = false;
        state.generation += 1;
        state.pending.clear();
    }

    pub fn plug(&self) {
        self.lock().present = true;
    }

    /// Make the next availability check on an open handle fail once.
    pub fn fail_next_read(&self) {
        self.lock().fail_next_read = true;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opened_at.len()
    }

    pub fn opened_at(&self) -> Vec<Instant> {
        self.lock().opened_at.clone()
    }

    /// Handles currently alive (opened and not yet dropped).
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackOpener {
    line: LoopbackLine,
}

impl DeviceOpener for LoopbackOpener {
    fn open(&self, port: &str, _baud: u32) -> io::Result<Box<dyn SerialDevice>> {
        let mut state = self.line.lock();
        if !state.present {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device: {port}"),
            ));
        }
        state.open_handles += 1;
        state.opened_at.push(Instant::now());
        Ok(Box::new(LoopbackDevice {
            line: self.line.clone(),
            generation: state.generation,
        }))
    }
}

struct LoopbackDevice {
    line: LoopbackLine,
    generation: u64,
}

impl LoopbackDevice {
    fn check(&self, state: &mut LineState) -> io::Result<()> {
        if state.generation != self.generation || !state.present {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device disconnected",
            ));
        }
        if std::mem::take(&mut state.fail_next_read) {
            return Err(io::Error::other("injected read failure"));
        }
        Ok(())
    }
}

impl SerialDevice for LoopbackDevice {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut state = self.line.lock();
        self.check(&mut state)?;
        Ok(state.pending.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.line.lock();
        let count = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        let mut state = self.line.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}
