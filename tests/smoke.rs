//! Smoke tests -- verify the binary runs, parses its commands and maps
//! failures to exit codes.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::process::{Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;

fn netlat() -> Command {
    let mut cmd = Command::cargo_bin("netlat").unwrap();
    cmd.env_remove("NETLAT_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Connect with a valid header so the readiness check is not itself a
/// shutdown request.
fn wait_until_listening(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream.write_all(&1u32.to_be_bytes()).unwrap();
            return;
        }
        assert!(Instant::now() < deadline, "server did not start");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn wait_until_refused(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
        let _ = stream.write_all(&1u32.to_be_bytes());
        assert!(Instant::now() < deadline, "server did not stop");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_cli_help() {
    netlat()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("connection-cost and transaction-latency"));
}

#[test]
fn test_cli_version() {
    netlat()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("netlat"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        ["connect", "serve", "--help"],
        ["connect", "run", "--help"],
        ["connect", "shutdown", "--help"],
        ["tcp", "serve", "--help"],
        ["tcp", "run", "--help"],
        ["tcp", "shutdown", "--help"],
    ] {
        netlat().args(args).assert().success();
    }
}

#[test]
fn test_tcp_run_accepts_message_size() {
    netlat()
        .args(["tcp", "run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--message-size"));
}

#[test]
fn test_unreachable_server_exits_7() {
    let port = free_port();
    netlat()
        .args(["connect", "run", "127.0.0.1", "--service", &format!("-{port}")])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("unreachable"));
}

#[test]
fn test_bad_config_exits_64() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[network]\nbacklog = 0").unwrap();
    netlat()
        .args(["connect", "run", "127.0.0.1", "--config"])
        .arg(file.path())
        .assert()
        .code(64);
}

#[test]
fn test_tcp_serve_run_shutdown() {
    let port = free_port();
    let service = format!("-{port}");
    let mut server = StdCommand::new(assert_cmd::cargo::cargo_bin("netlat"))
        .args(["tcp", "serve", "--bind", "127.0.0.1", "--service", &service])
        .env_remove("NETLAT_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_until_listening(port);

    netlat()
        .args(["tcp", "run", "127.0.0.1", "--service", &service, "-N", "3", "-m", "64"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TCP latency using 127.0.0.1: "))
        .stdout(predicate::str::contains("microseconds"));

    netlat()
        .args(["tcp", "shutdown", "127.0.0.1", "--service", &service])
        .assert()
        .success();

    let status = server.wait().unwrap();
    assert!(status.success());
}

#[test]
fn test_background_server_detaches_and_stops_on_shutdown() {
    let port = free_port();
    let service = format!("-{port}");
    netlat()
        .args(["tcp", "serve", "--bind", "127.0.0.1", "--service", &service, "--background"])
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("127.0.0.1:{port}")));

    // already listening when the launcher returns
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("background server not listening");
    stream.write_all(&1u32.to_be_bytes()).unwrap();
    drop(stream);

    netlat()
        .args(["tcp", "shutdown", "127.0.0.1", "--service", &service])
        .assert()
        .success();
    wait_until_refused(port);
}

#[test]
fn test_background_bind_failure_passes_exit_code_through() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    netlat()
        .args(["connect", "serve", "--bind", "127.0.0.1", "--service", &format!("-{port}"), "--background"])
        .timeout(Duration::from_secs(20))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("exited before listening"));
}
