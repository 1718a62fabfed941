//! Config loader integration tests: ~/.arduwrap/config.yaml

use std::path::PathBuf;

use arduwrap_core::{config, paths, ConfigError, DaemonConfig};
use assert_fs::prelude::*;
use predicates::prelude::*;

#[test]
fn missing_config_file_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, DaemonConfig::default());
}

#[test]
fn config_file_overrides_selected_fields() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".arduwrap/config.yaml")
        .write_str(
            "port: /dev/cu.usbmodem1101\n\
             baud: 115200\n\
             log_dir: /var/tmp/arduwrap\n\
             rotate_bytes: 0\n\
             tool:\n  config_file: /work/arduino-cli.yaml\n\
             timing:\n  fast_reconnect_ms: 25\n",
        )
        .expect("write config");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.port, "/dev/cu.usbmodem1101");
    assert_eq!(loaded.baud, 115_200);
    assert_eq!(loaded.log_dir, Some(PathBuf::from("/var/tmp/arduwrap")));
    assert_eq!(loaded.rotate_bytes, 0);
    assert_eq!(
        loaded.tool.config_file,
        Some(PathBuf::from("/work/arduino-cli.yaml"))
    );
    // Unset nested fields keep their defaults.
    assert_eq!(loaded.tool.program, "arduino-cli");
    assert_eq!(loaded.timing.fast_reconnect_ms, 25);
    assert_eq!(loaded.timing.reconnect_ms, 500);
    assert_eq!(loaded.buffer_bytes, 512 * 1024);
    loaded.validate().expect("valid");
}

#[test]
fn empty_config_file_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".arduwrap/config.yaml")
        .write_str("\n")
        .expect("write config");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, DaemonConfig::default());
}

#[test]
fn corrupt_config_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".arduwrap/config.yaml")
        .write_str("baud: [unclosed\n")
        .expect("write config");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "got: {err}");
}

#[test]
fn layout_lives_under_dot_arduwrap() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let socket = paths::socket_path(home.path());
    assert!(predicate::str::ends_with(".arduwrap/arduwrap.sock")
        .eval(&socket.to_string_lossy()));
    assert!(paths::config_path(home.path()).starts_with(paths::arduwrap_root(home.path())));
}
