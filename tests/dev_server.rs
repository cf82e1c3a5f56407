//! Integration tests for dev server supervision with scripted interpreters
//!
//! These tests verify that:
//! - The announced loopback port is the one the supervisor resolves to
//! - A process that exits before announcing is a failure, never a port
//! - A silent process is stopped, softly first, once the discovery timeout passes
//! - Shutdown escalates to a forced kill and removes ephemeral roots
//! - A failed start still removes its ephemeral root
//! - Children left behind by an interpreter that already exited are killed

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use deskpack::config::ServerConfig;
use deskpack::fsops::FsMutator;
use deskpack::processes;
use deskpack::runtime::RuntimeRoot;
use deskpack::server::{DevServer, InterpreterCommand, ServerError, ServerState};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn interpreter(temp: &TempDir, body: &str) -> PathBuf {
    let path = temp.path().join("fake-php");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn server_config(port_timeout_ms: u64) -> ServerConfig {
    ServerConfig {
        port_timeout_ms,
        shutdown_grace_ms: 300,
        ..ServerConfig::default()
    }
}

fn ephemeral_docroot(temp: &TempDir) -> (RuntimeRoot, PathBuf) {
    let docroot = temp.path().join("www");
    fs::create_dir_all(&docroot).unwrap();
    fs::write(docroot.join("index.php"), "<?php echo 'ok';").unwrap();

    let root = RuntimeRoot::ephemeral(temp.path(), "deskpack", "1.0.0");
    root.sync(&docroot).unwrap();
    let served = root.path().to_path_buf();
    assert!(served.join("index.php").exists());
    (root, served)
}

fn wait_until_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !processes::is_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_resolves_announced_port() {
    let temp = TempDir::new().unwrap();
    let exe = interpreter(
        &temp,
        "echo '[Tue Oct 15 10:21:04 2024] PHP 8.3.12 Development Server (http://127.0.0.1:45873) started' >&2\n\
         exec sleep 30",
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(5_000));
    let port = server.start().await.unwrap();

    assert_eq!(port, 45873);
    assert_eq!(server.state(), &ServerState::Listening { port: 45873 });
    assert_eq!(
        server.entry_url("index.php").as_deref(),
        Some("http://127.0.0.1:45873/index.php")
    );

    let pid = server.pid().unwrap();
    server.shutdown().await.unwrap();
    assert!(matches!(server.state(), ServerState::Exited { .. }));
    assert!(wait_until_gone(pid));
}

#[tokio::test]
async fn test_exit_before_announcement_is_failure() {
    let temp = TempDir::new().unwrap();
    let exe = interpreter(
        &temp,
        "echo 'Failed loading php.ini: no such file' >&2\nexit 255",
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(5_000));
    let err = server.start().await.unwrap_err();

    assert!(matches!(err, ServerError::ExitedEarly { code: Some(255) }));
    assert_eq!(server.state(), &ServerState::Exited { code: Some(255) });
    assert_eq!(server.port(), None);
}

#[tokio::test]
async fn test_silent_process_times_out_and_is_killed() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("pid");
    let exe = interpreter(
        &temp,
        &format!("echo $$ > '{}'\nexec sleep 30", marker.display()),
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(400));
    let started = Instant::now();
    let err = server.start().await.unwrap_err();

    assert!(matches!(err, ServerError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(server.state(), ServerState::Failed(_)));

    let pid: u32 = fs::read_to_string(&marker).unwrap().trim().parse().unwrap();
    assert!(wait_until_gone(pid));
}

#[tokio::test]
async fn test_shutdown_forces_stubborn_process() {
    let temp = TempDir::new().unwrap();
    let exe = interpreter(
        &temp,
        "trap '' TERM\n\
         echo 'Listening on http://localhost:39011'\n\
         while true; do sleep 1; done",
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(5_000));
    assert_eq!(server.start().await.unwrap(), 39011);
    let pid = server.pid().unwrap();

    let started = Instant::now();
    server.shutdown().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(wait_until_gone(pid));
    assert!(matches!(
        server.shutdown().await,
        Err(ServerError::NotRunning)
    ));
}

#[tokio::test]
async fn test_shutdown_removes_ephemeral_root() {
    let temp = TempDir::new().unwrap();
    let (root, served) = ephemeral_docroot(&temp);

    let exe = interpreter(
        &temp,
        "echo 'Development Server (http://127.0.0.1:41234) started'\nexec sleep 30",
    );
    let command = InterpreterCommand::new(&exe).current_dir(&served);
    let mut server = DevServer::new(command, server_config(5_000))
        .with_runtime_root(root, FsMutator::default());

    server.start().await.unwrap();
    server.shutdown().await.unwrap();
    assert!(!served.exists());
}

#[tokio::test]
async fn test_failed_start_removes_ephemeral_root() {
    let temp = TempDir::new().unwrap();
    let (root, served) = ephemeral_docroot(&temp);

    let exe = interpreter(&temp, "echo 'PHP Fatal error: bad ini' >&2\nexit 1");
    let command = InterpreterCommand::new(&exe).current_dir(&served);
    let mut server = DevServer::new(command, server_config(5_000))
        .with_runtime_root(root, FsMutator::default());

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::ExitedEarly { code: Some(1) }));
    assert!(!served.exists());
}

#[tokio::test]
async fn test_timeout_removes_ephemeral_root() {
    let temp = TempDir::new().unwrap();
    let (root, served) = ephemeral_docroot(&temp);

    let exe = interpreter(&temp, "exec sleep 30");
    let command = InterpreterCommand::new(&exe).current_dir(&served);
    let mut server = DevServer::new(command, server_config(300))
        .with_runtime_root(root, FsMutator::default());

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }));
    assert!(!served.exists());
}

#[tokio::test]
async fn test_shutdown_kills_children_of_exited_interpreter() {
    let temp = TempDir::new().unwrap();
    let helper_pid = temp.path().join("helper.pid");
    let exe = interpreter(
        &temp,
        &format!(
            "sleep 30 &\n\
             echo $! > '{}'\n\
             echo 'Listening on http://localhost:39012'\n\
             sleep 0.3\n\
             exit 0",
            helper_pid.display()
        ),
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(5_000));
    assert_eq!(server.start().await.unwrap(), 39012);
    let pid = server.pid().unwrap();
    assert!(wait_until_gone(pid));

    let helper: u32 = fs::read_to_string(&helper_pid)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(processes::is_running(helper));

    server.shutdown().await.unwrap();
    assert_eq!(server.state(), &ServerState::Exited { code: Some(0) });
    assert!(wait_until_gone(helper));
}

#[tokio::test]
async fn test_timeout_asks_interpreter_to_stop_first() {
    let temp = TempDir::new().unwrap();
    let stopped = temp.path().join("stopped");
    let exe = interpreter(
        &temp,
        &format!(
            "trap 'echo term > \"{}\"; exit 0' TERM\n\
             while true; do sleep 0.1; done",
            stopped.display()
        ),
    );

    let mut server = DevServer::new(InterpreterCommand::new(&exe), server_config(300));
    let err = server.start().await.unwrap_err();

    assert!(matches!(err, ServerError::Timeout { .. }));
    assert_eq!(fs::read_to_string(&stopped).unwrap().trim(), "term");
}
