//! CLI contract tests for the `sockpool` binary.
//!
//! Exercises argument handling, configuration errors, and a real
//! serve/send round trip over a temporary unix socket.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn sockpool() -> Command {
    Command::cargo_bin("sockpool").expect("sockpool binary should be built")
}

/// Kills the server when the test ends, pass or fail.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_server(socket: &Path) -> ServerGuard {
    let binary = assert_cmd::cargo::cargo_bin("sockpool");
    let child = std::process::Command::new(binary)
        .args(["--log-level", "warn", "serve", "--listen"])
        .arg(format!("unix:{}", socket.display()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn server");
    ServerGuard(child)
}

fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "server never created {}", path.display());
        std::thread::sleep(Duration::from_millis(20));
    }
}

// =============================================================================
// Arguments
// =============================================================================

#[test]
fn help_lists_subcommands() {
    sockpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve").and(predicate::str::contains("send")));
}

#[test]
fn missing_subcommand_fails() {
    sockpool().assert().failure();
}

#[test]
fn invalid_address_is_usage_error() {
    sockpool()
        .args(["send", "--connect", "unix:", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty unix socket path"));
}

#[test]
fn unknown_log_format_is_rejected() {
    sockpool()
        .args(["--log-format", "xml", "send", "--connect", "127.0.0.1:1", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log format"));
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn missing_config_file_is_reported() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("missing.toml");
    sockpool()
        .arg("--config")
        .arg(&path)
        .args(["send", "--connect", "127.0.0.1:1", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn zero_capacity_is_rejected_before_binding() {
    let dir = TempDir::new().expect("create temp dir");
    let socket = dir.path().join("never.sock");
    sockpool()
        .args(["serve", "--capacity", "0", "--listen"])
        .arg(format!("unix:{}", socket.display()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
    assert!(!socket.exists());
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn send_to_absent_server_fails() {
    let dir = TempDir::new().expect("create temp dir");
    let socket = dir.path().join("absent.sock");
    sockpool()
        .args(["send", "--connect"])
        .arg(format!("unix:{}", socket.display()))
        .arg("hello")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to connect"));
}

#[test]
fn serve_echoes_what_send_sends() {
    let dir = TempDir::new().expect("create temp dir");
    let socket = dir.path().join("echo.sock");
    let _server = spawn_server(&socket);
    wait_for_path(&socket);

    for message in ["hello", "second message"] {
        sockpool()
            .args(["send", "--connect"])
            .arg(format!("unix:{}", socket.display()))
            .arg(message)
            .timeout(Duration::from_secs(10))
            .assert()
            .success()
            .stdout(predicate::str::diff(format!("{message}\n")));
    }
}
