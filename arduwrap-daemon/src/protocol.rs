use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::compile::CompileOutcome;
use crate::error::{io_err, DaemonError};

/// Largest request the daemon will read from one connection.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// One JSON request per connection, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum DaemonRequest {
    Compile {
        #[serde(default)]
        args: Vec<String>,
    },
    Log {
        #[serde(default)]
        clear: bool,
    },
    Stop,
}

/// One JSON response per request. Fields that do not apply are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn compiled(outcome: &CompileOutcome) -> Self {
        Self {
            success: outcome.success(),
            exit_code: Some(outcome.exit_code),
            output: Some(outcome.output.clone()),
            ..Self::default()
        }
    }

    /// Log text, with invalid UTF-8 replaced.
    pub fn log(bytes: &[u8]) -> Self {
        Self {
            success: true,
            log: Some(String::from_utf8_lossy(bytes).into_owned()),
            ..Self::default()
        }
    }
}

/// Send one JSON request to the daemon socket and read the whole response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| io_err(socket, e))?;

    let mut body = String::new();
    stream
        .read_to_string(&mut body)
        .map_err(|e| io_err(socket, e))?;
    if body.trim().is_empty() {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(body.trim_end())?;
    Ok(response)
}

/// Ask the daemon to run the build tool. The response is returned as-is so
/// callers can forward output and exit code even on failure.
pub fn request_compile(socket: &Path, args: Vec<String>) -> Result<DaemonResponse, DaemonError> {
    send_request(socket, &DaemonRequest::Compile { args })
}

/// Fetch the buffered log text, optionally clearing it.
pub fn request_log(socket: &Path, clear: bool) -> Result<String, DaemonError> {
    let response = send_request(socket, &DaemonRequest::Log { clear })?;
    response_into_result(response).map(|response| response.log.unwrap_or_default())
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::Stop)?;
    response_into_result(response).map(|_| ())
}

fn response_into_result(response: DaemonResponse) -> Result<DaemonResponse, DaemonError> {
    if response.success {
        Ok(response)
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

/// True once `buf` holds a whole request: a newline, or one complete JSON
/// value. Malformed input also counts, so it can be reported without
/// waiting for more bytes.
pub fn request_complete(buf: &[u8]) -> bool {
    if buf.contains(&b'\n') {
        return true;
    }
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<IgnoredAny>();
    match values.next() {
        None => false,
        Some(Ok(_)) => true,
        Some(Err(err)) => !err.is_eof(),
    }
}

/// Decode one request payload (trailing newline optional).
pub fn decode_request(payload: &[u8]) -> Result<DaemonRequest, String> {
    let text = std::str::from_utf8(payload).map_err(|err| format!("request is not UTF-8: {err}"))?;
    let text = text.trim();
    if text.is_empty() {
        return Err("empty request".to_string());
    }
    serde_json::from_str(text).map_err(|err| format!("invalid request: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_command_tag() {
        let compile = DaemonRequest::Compile {
            args: vec!["--fqbn".into(), "esp32:esp32:esp32".into()],
        };
        assert_eq!(
            serde_json::to_value(&compile).unwrap(),
            json!({"command": "compile", "args": ["--fqbn", "esp32:esp32:esp32"]})
        );
        assert_eq!(
            serde_json::to_value(DaemonRequest::Stop).unwrap(),
            json!({"command": "stop"})
        );
    }

    #[test]
    fn optional_request_fields_default() {
        assert_eq!(
            decode_request(br#"{"command":"log"}"#).unwrap(),
            DaemonRequest::Log { clear: false }
        );
        assert_eq!(
            decode_request(b"{\"command\":\"compile\"}\n").unwrap(),
            DaemonRequest::Compile { args: vec![] }
        );
    }

    #[test]
    fn unknown_and_malformed_requests_are_described() {
        let err = decode_request(br#"{"command":"flash"}"#).unwrap_err();
        assert!(err.contains("flash"), "got: {err}");

        let err = decode_request(b"not json").unwrap_err();
        assert!(err.starts_with("invalid request"), "got: {err}");

        let err = decode_request(br#"{"args":[]}"#).unwrap_err();
        assert!(err.contains("command"), "got: {err}");

        assert_eq!(decode_request(b"  \n").unwrap_err(), "empty request");
    }

    #[test]
    fn request_is_complete_without_newline_once_json_closes() {
        assert!(!request_complete(b""));
        assert!(!request_complete(b"  "));
        assert!(!request_complete(br#"{"command":"#));
        assert!(!request_complete(br#"{"command":"compile","args":["--fqbn""#));
        assert!(request_complete(br#"{"command":"log"}"#));
        assert!(request_complete(b"{\"command\":\n"));
        assert!(request_complete(b"not json"));
    }

    #[test]
    fn responses_omit_fields_that_do_not_apply() {
        assert_eq!(
            serde_json::to_value(DaemonResponse::ok()).unwrap(),
            json!({"success": true})
        );
        assert_eq!(
            serde_json::to_value(DaemonResponse::error("No arguments provided")).unwrap(),
            json!({"success": false, "error": "No arguments provided"})
        );

        let outcome = CompileOutcome {
            exit_code: 2,
            output: "error\n".to_string(),
            reset_detected: false,
        };
        assert_eq!(
            serde_json::to_value(DaemonResponse::compiled(&outcome)).unwrap(),
            json!({"success": false, "exit_code": 2, "output": "error\n"})
        );
    }

    #[test]
    fn log_response_replaces_invalid_utf8() {
        let response = DaemonResponse::log(b"ok \xff\xfe done");
        assert_eq!(response.log.as_deref(), Some("ok \u{fffd}\u{fffd} done"));
    }

    #[test]
    fn missing_socket_means_daemon_not_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("arduwrap.sock");
        let err = send_request(&socket, &DaemonRequest::Stop).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }
}
