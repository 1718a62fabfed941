//! arduwrap daemon: serial monitor + compile orchestration + socket server.

pub mod compile;
pub mod device;
mod error;
pub mod log_store;
pub mod loopback;
pub mod monitor;
pub mod persistent_log;
pub mod protocol;
mod runtime;

pub use compile::{CompileError, CompileOrchestrator, CompileOutcome};
pub use device::{DeviceOpener, SerialDevice, SystemSerialOpener};
pub use error::DaemonError;
pub use log_store::LogStore;
pub use monitor::{Monitor, PauseGuard};
pub use persistent_log::latest_log_file;
pub use protocol::{
    request_compile, request_log, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{start_blocking, Daemon, ServerContext};
