use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arduwrap_core::DaemonConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::compile::CompileOrchestrator;
use crate::device::{DeviceOpener, SystemSerialOpener};
use crate::error::{io_err, DaemonError};
use crate::log_store::LogStore;
use crate::monitor::Monitor;
use crate::protocol::{
    decode_request, request_complete, DaemonRequest, DaemonResponse, MAX_REQUEST_BYTES,
};

/// Everything a request handler may touch. Built once per daemon.
pub struct ServerContext {
    pub monitor: Arc<Monitor>,
    pub store: Arc<LogStore>,
    pub compiler: CompileOrchestrator,
    request_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerContext {
    pub fn new(
        config: &DaemonConfig,
        opener: Arc<dyn DeviceOpener>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self, DaemonError> {
        let store = Arc::new(LogStore::from_config(config)?);
        let monitor = Arc::new(Monitor::new(
            config.port.clone(),
            config.baud,
            config.timing,
            opener,
            store.clone(),
        ));
        let compiler = CompileOrchestrator::from_config(config, monitor.clone(), store.clone());
        Ok(Self {
            monitor,
            store,
            compiler,
            request_timeout: config.request_timeout(),
            shutdown_tx,
        })
    }

    /// Handle one decoded request.
    pub async fn dispatch(&self, request: DaemonRequest) -> DaemonResponse {
        match request {
            DaemonRequest::Compile { args } => match self.compiler.run(&args).await {
                Ok(outcome) => DaemonResponse::compiled(&outcome),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            DaemonRequest::Log { clear } => {
                let snapshot = if clear {
                    self.store.take_snapshot()
                } else {
                    self.store.snapshot()
                };
                DaemonResponse::log(&snapshot)
            }
            DaemonRequest::Stop => {
                self.request_stop();
                DaemonResponse::ok()
            }
        }
    }

    /// Stop the monitor and tell every loop to wind down. Idempotent.
    pub fn request_stop(&self) {
        self.monitor.stop();
        let _ = self.shutdown_tx.send(());
    }
}

/// A bound daemon, ready to run.
pub struct Daemon {
    socket: PathBuf,
    listener: UnixListener,
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Validate `config`, bind the rendezvous socket and build the
    /// components. Nothing is started; a failure leaves nothing running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        config: &DaemonConfig,
        socket: PathBuf,
        opener: Arc<dyn DeviceOpener>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        if let Some(parent) = socket.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        prepare_socket_for_bind(&socket)?;

        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let context = Arc::new(ServerContext::new(config, opener, shutdown_tx.clone())?);

        let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
        if let Err(err) = set_socket_permissions(&socket) {
            let _ = fs::remove_file(&socket);
            return Err(err);
        }

        Ok(Self {
            socket,
            listener,
            context,
            shutdown_tx,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Sending on this stops the daemon, like a `stop` request.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start the monitor and serve requests until stopped.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon {
            socket,
            listener,
            context,
            shutdown_tx,
        } = self;

        tracing::info!(socket = %socket.display(), "listening");
        context.monitor.start();

        let monitor_handle = {
            let monitor = context.monitor.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::task::spawn_blocking(move || monitor.run(shutdown_rx))
        };

        let signal_handle = {
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move {
                let mut shutdown_rx = shutdown.subscribe();
                tokio::select! {
                    _ = shutdown_rx.recv() => Ok(()),
                    signal = wait_for_termination() => {
                        match signal {
                            Ok(()) => {
                                tracing::info!("received termination signal, shutting down daemon");
                                let _ = shutdown.send(());
                                Ok(())
                            }
                            Err(err) => Err(DaemonError::Protocol(format!("signal handler failed: {err}"))),
                        }
                    }
                }
            })
        };

        let served = socket_server_loop(&listener, &socket, &context, shutdown_tx.subscribe()).await;

        // Wind down in order: loops first, then the device, then the log file.
        let _ = shutdown_tx.send(());
        context.monitor.stop();
        if let Err(err) = monitor_handle.await {
            tracing::error!(error = %err, "monitor task join failure");
        }
        context.store.close();
        drop(listener);
        if socket.exists() {
            let _ = fs::remove_file(&socket);
        }
        tracing::info!("daemon stopped");

        let signal_result = match signal_handle.await {
            Ok(inner) => inner,
            Err(err) => Err(DaemonError::Protocol(format!(
                "signal_handler task join failure: {err}"
            ))),
        };
        served?;
        signal_result
    }
}

/// Start the daemon on the real serial port and block until it exits.
pub fn start_blocking(config: &DaemonConfig, home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let socket = config.socket_path(home);
    runtime.block_on(async {
        let daemon = Daemon::bind(config, socket, Arc::new(SystemSerialOpener::default()))?;
        tracing::info!(
            port = %config.port,
            baud = config.baud,
            "started monitoring"
        );
        daemon.run().await
    })
}

/// How one connection ended, from the accept loop's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Answered,
    ShuttingDown,
}

/// What the daemon got from a client before answering.
#[derive(Debug, PartialEq, Eq)]
enum RequestRead {
    Complete(Vec<u8>),
    TooLarge,
    TimedOut,
}

async fn socket_server_loop(
    listener: &UnixListener,
    socket: &Path,
    context: &ServerContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::error!(error = %err, "error accepting connection");
                        return Err(io_err(socket, err));
                    }
                };
                // One connection at a time: the next accept waits for this one.
                match handle_socket_client(stream, context, &mut shutdown_rx).await {
                    Ok(Served::Answered) => {}
                    Ok(Served::ShuttingDown) => break,
                    Err(err) => tracing::error!(error = %err, "error handling request"),
                }
            }
        }
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: &ServerContext,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<Served, DaemonError> {
    let (mut reader, mut writer) = stream.into_split();

    let read = tokio::select! {
        biased;
        _ = shutdown_rx.recv() => {
            tracing::info!("shutdown while waiting for a request, dropping client");
            let _ = write_response(&mut writer, &DaemonResponse::error("daemon is shutting down")).await;
            return Ok(Served::ShuttingDown);
        }
        read = read_request(&mut reader, context.request_timeout) => {
            read.map_err(|e| io_err("daemon socket read", e))?
        }
    };

    let response = match read {
        RequestRead::TooLarge => {
            DaemonResponse::error(format!("request exceeds {MAX_REQUEST_BYTES} bytes"))
        }
        RequestRead::TimedOut => {
            tracing::warn!(timeout = ?context.request_timeout, "client stalled before sending a request");
            DaemonResponse::error("timed out waiting for request")
        }
        RequestRead::Complete(payload) => {
            let request = payload.split(|&b| b == b'\n').next().unwrap_or_default();
            match decode_request(request) {
                Ok(request) => {
                    tracing::debug!(request = ?request, "handling request");
                    context.dispatch(request).await
                }
                Err(message) => DaemonResponse::error(message),
            }
        }
    };

    write_response(&mut writer, &response).await?;
    Ok(Served::Answered)
}

/// Read until a whole request has arrived, the client closes its side, the
/// size limit is passed, or `limit` elapses.
async fn read_request<R>(reader: &mut R, limit: Duration) -> io::Result<RequestRead>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut payload = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(RequestRead::Complete(payload));
            }
            payload.extend_from_slice(&chunk[..n]);
            if payload.len() > MAX_REQUEST_BYTES {
                return Ok(RequestRead::TooLarge);
            }
            if request_complete(&payload) {
                return Ok(RequestRead::Complete(payload));
            }
        }
    };
    match tokio::time::timeout(limit, read).await {
        Ok(result) => result,
        Err(_) => Ok(RequestRead::TimedOut),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    writer
        .shutdown()
        .await
        .map_err(|e| io_err("daemon socket shutdown", e))?;
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::AlreadyRunning {
                socket: socket.to_path_buf(),
            });
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // stdout carries the device stream; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener as StdUnixListener;

    use serde_json::Value;
    use tempfile::TempDir;

    use crate::loopback::LoopbackLine;

    fn test_config(port: &str) -> DaemonConfig {
        DaemonConfig {
            port: port.to_string(),
            baud: 115_200,
            ..DaemonConfig::default()
        }
    }

    fn context_on(line: &LoopbackLine) -> (ServerContext, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let context =
            ServerContext::new(&test_config("/dev/ttySIM"), Arc::new(line.opener()), shutdown_tx)
                .expect("context");
        (context, shutdown_rx)
    }

    async fn roundtrip(context: &ServerContext, payload: &[u8]) -> Value {
        let (client, server) = UnixStream::pair().expect("socket pair");
        let payload = payload.to_vec();
        let client_task = tokio::spawn(async move {
            let (mut client_read, mut client_write) = client.into_split();
            // The server may stop reading early on oversized input.
            let _ = client_write.write_all(&payload).await;
            let _ = client_write.shutdown().await;
            let mut body = String::new();
            client_read.read_to_string(&mut body).await.expect("read response");
            body
        });

        let mut idle = context.shutdown_tx.subscribe();
        let served = handle_socket_client(server, context, &mut idle).await.expect("handle");
        assert_eq!(served, Served::Answered);

        let body = client_task.await.expect("client task");
        serde_json::from_str(body.trim()).expect("response JSON")
    }

    #[tokio::test]
    async fn request_without_newline_is_read_once_json_closes() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(br#"{"command":"log"}"#).await.expect("write");

        // The client keeps its side open; the read must not wait for EOF.
        let read = read_request(&mut server, Duration::from_secs(5)).await.expect("read");
        assert_eq!(read, RequestRead::Complete(br#"{"command":"log"}"#.to_vec()));
        drop(client);
    }

    #[tokio::test]
    async fn stalled_partial_request_times_out() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(br#"{"command":"#).await.expect("write");

        let read = read_request(&mut server, Duration::from_millis(50)).await.expect("read");
        assert_eq!(read, RequestRead::TimedOut);
        drop(client);
    }

    #[tokio::test]
    async fn stalled_client_gets_timeout_error() {
        let line = LoopbackLine::new();
        let (mut context, _rx) = context_on(&line);
        context.request_timeout = Duration::from_millis(50);

        let (client, server) = UnixStream::pair().expect("socket pair");
        let client_task = tokio::spawn(async move {
            let (mut client_read, mut client_write) = client.into_split();
            client_write.write_all(b"{\"command\":").await.expect("write");
            let mut body = String::new();
            client_read.read_to_string(&mut body).await.expect("read response");
            drop(client_write);
            body
        });

        let mut idle = context.shutdown_tx.subscribe();
        let served = handle_socket_client(server, &context, &mut idle).await.expect("handle");
        assert_eq!(served, Served::Answered);

        let body = client_task.await.expect("client task");
        let response: Value = serde_json::from_str(body.trim()).expect("response JSON");
        assert_eq!(response["success"], Value::Bool(false));
        assert_eq!(response["error"], Value::from("timed out waiting for request"));
    }

    #[tokio::test]
    async fn shutdown_abandons_a_stalled_client() {
        let line = LoopbackLine::new();
        let (context, _rx) = context_on(&line);

        let (client, server) = UnixStream::pair().expect("socket pair");
        let (mut client_read, mut client_write) = client.into_split();
        client_write.write_all(b"{\"command\":").await.expect("write");

        let mut shutdown_rx = context.shutdown_tx.subscribe();
        context.request_stop();
        let served = tokio::time::timeout(
            Duration::from_secs(1),
            handle_socket_client(server, &context, &mut shutdown_rx),
        )
        .await
        .expect("handler returns before the request timeout")
        .expect("handle");
        assert_eq!(served, Served::ShuttingDown);

        let mut body = String::new();
        client_read.read_to_string(&mut body).await.expect("read response");
        let response: Value = serde_json::from_str(body.trim()).expect("response JSON");
        assert_eq!(response["error"], Value::from("daemon is shutting down"));
    }

    #[tokio::test]
    async fn log_request_returns_and_optionally_clears_buffer() {
        let line = LoopbackLine::new();
        let (context, _rx) = context_on(&line);
        context.store.append(b"boot: ok\n");

        let response = roundtrip(&context, b"{\"command\":\"log\"}\n").await;
        assert_eq!(response["success"], Value::Bool(true));
        assert_eq!(response["log"], Value::from("boot: ok\n"));

        let response = roundtrip(&context, br#"{"command":"log","clear":true}"#).await;
        assert_eq!(response["log"], Value::from("boot: ok\n"));
        assert!(context.store.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_requests_get_error_responses() {
        let line = LoopbackLine::new();
        let (context, _rx) = context_on(&line);

        let response = roundtrip(&context, b"{not json\n").await;
        assert_eq!(response["success"], Value::Bool(false));
        assert!(response["error"].as_str().unwrap().starts_with("invalid request"));

        let response = roundtrip(&context, br#"{"command":"reboot"}"#).await;
        assert_eq!(response["success"], Value::Bool(false));
        assert!(response["error"].as_str().unwrap().contains("reboot"));
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let line = LoopbackLine::new();
        let (context, _rx) = context_on(&line);

        let mut payload = br#"{"command":"compile","args":[""#.to_vec();
        payload.extend(std::iter::repeat(b'a').take(MAX_REQUEST_BYTES));
        payload.extend(br#""]}"#);
        let response = roundtrip(&context, &payload).await;
        assert_eq!(response["success"], Value::Bool(false));
        assert!(response["error"].as_str().unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn compile_without_args_fails_cleanly() {
        let line = LoopbackLine::new();
        let (context, _rx) = context_on(&line);
        context.monitor.start();

        let response = roundtrip(&context, br#"{"command":"compile","args":[]}"#).await;
        assert_eq!(response["success"], Value::Bool(false));
        assert_eq!(response["error"], Value::from("No arguments provided"));
        assert!(!context.monitor.is_paused());
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown_and_is_repeatable() {
        let line = LoopbackLine::new();
        let (context, mut shutdown_rx) = context_on(&line);
        context.monitor.start();
        assert!(context.monitor.is_open());

        let response = context.dispatch(DaemonRequest::Stop).await;
        assert!(response.success);
        assert!(!context.monitor.is_running());
        assert!(!context.monitor.is_open());
        shutdown_rx.recv().await.expect("shutdown signal");

        let response = context.dispatch(DaemonRequest::Stop).await;
        assert!(response.success);
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let dir = TempDir::new().expect("dir");
        let socket = dir.path().join("arduwrap.sock");
        drop(StdUnixListener::bind(&socket).expect("bind"));
        assert!(socket.exists(), "socket file outlives its listener");

        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[test]
    fn live_socket_refuses_second_daemon() {
        let dir = TempDir::new().expect("dir");
        let socket = dir.path().join("arduwrap.sock");
        let _listener = StdUnixListener::bind(&socket).expect("bind");

        let err = prepare_socket_for_bind(&socket).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { .. }), "got: {err}");
        assert!(socket.exists());
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config_without_creating_socket() {
        let dir = TempDir::new().expect("dir");
        let socket = dir.path().join("arduwrap.sock");
        let line = LoopbackLine::new();

        let err = Daemon::bind(&test_config(""), socket.clone(), Arc::new(line.opener()))
            .err()
            .expect("bind fails");
        assert!(matches!(err, DaemonError::Config(_)), "got: {err}");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn bound_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("dir");
        let socket = dir.path().join("run").join("arduwrap.sock");
        let line = LoopbackLine::new();
        let daemon = Daemon::bind(&test_config("/dev/ttySIM"), socket.clone(), Arc::new(line.opener()))
            .expect("bind");

        let mode = fs::metadata(daemon.socket_path()).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
