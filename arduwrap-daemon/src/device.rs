//! Serial line driver seam.
//!
//! The monitor only ever talks to a [`DeviceOpener`] and the
//! [`SerialDevice`] handles it returns. Closing a device is dropping it.

use std::io::{self, Read};
use std::time::Duration;

/// An opened byte-stream device.
pub trait SerialDevice: Send {
    /// Number of bytes already waiting in the input buffer. Never blocks.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read bytes that are already waiting into `buf`.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens a device by name and speed. Failure is expected while the device
/// is absent (unplugged or re-enumerating).
pub trait DeviceOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialDevice>>;
}

/// Real serial ports via the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SystemSerialOpener {
    read_timeout: Duration,
}

impl Default for SystemSerialOpener {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl DeviceOpener for SystemSerialOpener {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn SerialDevice>> {
        let handle = serialport::new(port, baud)
            .timeout(self.read_timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(SystemSerial { handle }))
    }
}

struct SystemSerial {
    handle: Box<dyn serialport::SerialPort>,
}

impl SerialDevice for SystemSerial {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let waiting = self.handle.bytes_to_read().map_err(io::Error::from)?;
        Ok(waiting as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle.read(buf)
    }
}
