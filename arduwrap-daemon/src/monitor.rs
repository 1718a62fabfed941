//! Reconnecting serial monitor.
//!
//! The monitor is the only owner of the device handle. Its supervisory loop
//! keeps the port open while unpaused, forwards every byte it reads to the
//! echo sink (stdout) and the [`LogStore`], and treats any I/O error as a
//! disconnect followed by reconnect attempts.
//!
//! Pausing and opening are both decided under the device lock, so a paused
//! monitor never holds an open handle.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arduwrap_core::MonitorTiming;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::device::{DeviceOpener, SerialDevice};
use crate::log_store::LogStore;

type EchoSink = Box<dyn Write + Send>;

pub struct Monitor {
    port: String,
    baud: u32,
    timing: MonitorTiming,
    opener: Arc<dyn DeviceOpener>,
    store: Arc<LogStore>,
    device: Mutex<Option<Box<dyn SerialDevice>>>,
    echo: Mutex<EchoSink>,
    running: AtomicBool,
    paused: AtomicBool,
    eager: AtomicBool,
}

/// What the supervisory loop should do after one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Bytes were just read or a connection came up; go again immediately.
    Continue,
    Sleep(Duration),
    Exit,
}

impl Monitor {
    pub fn new(
        port: impl Into<String>,
        baud: u32,
        timing: MonitorTiming,
        opener: Arc<dyn DeviceOpener>,
        store: Arc<LogStore>,
    ) -> Self {
        Self {
            port: port.into(),
            baud,
            timing,
            opener,
            store,
            device: Mutex::new(None),
            echo: Mutex::new(Box::new(std::io::stdout())),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            eager: AtomicBool::new(false),
        }
    }

    /// Replace the stdout echo (tests capture or discard it).
    pub fn with_echo(self, echo: impl Write + Send + 'static) -> Self {
        *self.lock_echo() = Box::new(echo);
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Mark running, begin a new persistent log file, try a first open.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.store.start_series();
        self.store
            .write_marker(&format!("monitor started on {} at {} baud", self.port, self.baud));
        tracing::info!(port = %self.port, baud = self.baud, "monitor started");
        self.try_open();
    }

    /// Stop the loop and close the device. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let closed = self.lock_device().take().is_some();
        if was_running {
            self.store.write_marker("monitor stopped");
            tracing::info!(port = %self.port, closed, "monitor stopped");
        }
    }

    /// Release the port to a foreground tool. Idempotent.
    pub fn pause(&self) {
        let mut device = self.lock_device();
        let was_paused = self.paused.swap(true, Ordering::SeqCst);
        let closed = device.take().is_some();
        drop(device);
        if !was_paused {
            self.store.write_marker("monitor paused");
            tracing::info!(port = %self.port, closed, "monitor paused");
        }
    }

    /// Hand the port back; reconnect attempts use the fast interval until
    /// the next successful open.
    pub fn resume(&self) {
        self.eager.store(true, Ordering::SeqCst);
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            self.store.write_marker("monitor resumed");
            tracing::info!(port = %self.port, "monitor resumed");
        }
    }

    /// Pause now and resume when the guard is dropped, unless
    /// [`PauseGuard::resume_now`] already did.
    pub fn pause_guard(&self) -> PauseGuard<'_> {
        self.pause();
        PauseGuard {
            monitor: self,
            resumed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock_device().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_eager(&self) -> bool {
        self.eager.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Supervisory loop; returns once stopped or shutdown is broadcast.
    ///
    /// Device I/O is synchronous, so this blocks the calling thread. Run it on
    /// a dedicated thread (`spawn_blocking`), never on an async worker.
    pub fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut last_attempt = None;
        loop {
            let step = self.step(&mut last_attempt, Instant::now());
            if matches!(step, Step::Exit)
                || !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
            {
                break;
            }
            if let Step::Sleep(pause) = step {
                std::thread::sleep(pause);
            }
        }
        tracing::debug!(port = %self.port, "monitor loop exited");
    }

    /// One turn of the supervisory loop.
    pub(crate) fn step(&self, last_attempt: &mut Option<Instant>, now: Instant) -> Step {
        if !self.is_running() {
            return Step::Exit;
        }
        if self.is_paused() {
            return Step::Sleep(self.timing.paused_poll());
        }

        if !self.is_open() {
            let interval = self.timing.reconnect_interval(self.is_eager());
            let due = last_attempt.map_or(true, |at| now.saturating_duration_since(at) >= interval);
            if due {
                *last_attempt = Some(now);
                if self.try_open() {
                    return Step::Continue;
                }
            }
            return Step::Sleep(self.timing.reconnect_poll());
        }

        match self.read_available() {
            Ok(Some(bytes)) => {
                self.forward(&bytes);
                Step::Continue
            }
            Ok(None) => Step::Sleep(self.timing.idle()),
            Err(err) => {
                self.disconnect(&err);
                Step::Continue
            }
        }
    }

    /// Open the device unless paused, stopped, or already open.
    fn try_open(&self) -> bool {
        let mut device = self.lock_device();
        if device.is_some() {
            return true;
        }
        if self.is_paused() || !self.is_running() {
            return false;
        }
        match self.opener.open(&self.port, self.baud) {
            Ok(handle) => {
                *device = Some(handle);
                drop(device);
                self.eager.store(false, Ordering::SeqCst);
                self.store
                    .write_marker(&format!("connected to {} at {} baud", self.port, self.baud));
                tracing::info!(port = %self.port, baud = self.baud, "serial port opened");
                true
            }
            Err(err) => {
                tracing::debug!(port = %self.port, error = %err, "serial port not available");
                false
            }
        }
    }

    /// Everything currently waiting on the device, or `None` if nothing is.
    fn read_available(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut device = self.lock_device();
        let Some(handle) = device.as_mut() else {
            return Ok(None);
        };
        let waiting = handle.bytes_available()?;
        if waiting == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; waiting];
        let read = handle.read_available(&mut buf)?;
        buf.truncate(read);
        Ok((!buf.is_empty()).then_some(buf))
    }

    fn forward(&self, bytes: &[u8]) {
        {
            let mut echo = self.lock_echo();
            if let Err(err) = echo.write_all(bytes).and_then(|()| echo.flush()) {
                tracing::debug!(error = %err, "failed to echo serial output");
            }
        }
        self.store.append(bytes);
    }

    fn disconnect(&self, err: &std::io::Error) {
        let closed = self.lock_device().take().is_some();
        if closed {
            self.store
                .write_marker(&format!("disconnected from {}: {err}", self.port));
            tracing::warn!(port = %self.port, error = %err, "serial port disconnected");
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, Option<Box<dyn SerialDevice>>> {
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_echo(&self) -> MutexGuard<'_, EchoSink> {
        self.echo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scoped pause: the monitor is resumed exactly once, either explicitly via
/// [`PauseGuard::resume_now`] or when the guard goes out of scope.
pub struct PauseGuard<'a> {
    monitor: &'a Monitor,
    resumed: bool,
}

impl PauseGuard<'_> {
    pub fn resume_now(&mut self) {
        if !self.resumed {
            self.resumed = true;
            self.monitor.resume();
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.resume_now();
    }
}
