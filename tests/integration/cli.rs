#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::write_config;
use predicates::prelude::*;
use tempfile::tempdir;

const FLEET: &str = r#"version: "1"
servers:
  audio:
    pid_file: "/run/audio.pid"
    cmdline: "/usr/bin/audiod"
    restart: "restart audio"
    stop: "stop audio"
    cascade: [ui, net]
  net:
    pid_file: "/run/net.pid"
    cmdline: "/usr/bin/netd"
    restart: "restart net"
    stop: "stop net"
  ui:
    pid_file: "/run/ui.pid"
    cmdline: "/usr/bin/uid"
    restart: "restart ui"
    stop: "stop ui"
    cascade: [net]
"#;

fn fleetd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("fleetd"))
}

#[test]
fn check_accepts_valid_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), FLEET);

    fleetd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 3 servers"));
}

#[test]
fn check_rejects_unknown_cascade_target() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        r#"version: "1"
servers:
  audio:
    pid_file: "/run/audio.pid"
    cmdline: "/usr/bin/audiod"
    restart: "restart audio"
    stop: "stop audio"
    cascade: [video]
"#,
    );

    fleetd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("video"));
}

#[test]
fn check_reports_cycles_without_failing() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        r#"version: "1"
servers:
  a:
    pid_file: "/run/a.pid"
    cmdline: "a"
    restart: "restart a"
    stop: "stop a"
    cascade: [b]
  b:
    pid_file: "/run/b.pid"
    cmdline: "b"
    restart: "restart b"
    stop: "stop b"
    cascade: [a]
"#,
    );

    fleetd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("warning: cascade cycle"));
}

#[test]
fn check_rejects_bad_duration() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        &format!("{FLEET}supervisor:\n  tick_interval: \"soon\"\n"),
    );

    fleetd()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn order_prints_fleet_start_order() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), FLEET);

    // net gains one weight per path reaching it: itself, audio, ui and audio -> ui.
    fleetd()
        .args(["order", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("1. audio (priority 1)")
                .and(predicate::str::contains("2. ui (priority 2)"))
                .and(predicate::str::contains("3. net (priority 4)")),
        );
}

#[test]
fn order_prints_cascade_of_one_server() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), FLEET);

    fleetd()
        .args(["order", "--config"])
        .arg(&config)
        .args(["--server", "ui"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. ui").and(predicate::str::contains("2. net")));

    fleetd()
        .args(["order", "--config"])
        .arg(&config)
        .args(["--server", "video"])
        .assert()
        .failure();
}

#[test]
fn ctl_fails_without_running_supervisor() {
    let temp = tempdir().expect("failed to create tempdir");

    fleetd()
        .arg("ctl")
        .arg("--socket")
        .arg(temp.path().join("missing.sock"))
        .arg("ping")
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotAvailable"));
}

#[cfg(target_os = "linux")]
#[test]
fn run_serves_control_socket_until_shutdown() {
    use std::{
        process::{Command as StdCommand, Stdio},
        thread,
        time::{Duration, Instant},
    };

    use common::{
        PidCleanup, sleep_server, wait_for_new_pid, wait_for_path, wait_for_process_exit,
    };

    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let socket = dir.join("ctl.sock");
    let pid_file = dir.join("alpha.pid");
    let _cleanup = PidCleanup(vec![pid_file.clone()]);
    let config = write_config(
        dir,
        &format!(
            "version: \"1\"\ncontrol_socket: \"{}\"\nsupervisor:\n  tick_interval: 100ms\n  shutdown_settle: 100ms\n  kill_retry_interval: 50ms\nservers:\n{}",
            socket.display(),
            sleep_server(dir, "alpha", 305, &[]),
        ),
    );

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("fleetd"))
        .args(["run", "--config"])
        .arg(&config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start fleetd");

    wait_for_path(&socket);
    let alpha = wait_for_new_pid(&pid_file, None);

    fleetd()
        .arg("ctl")
        .arg("--socket")
        .arg(&socket)
        .arg("ping")
        .assert()
        .success()
        .stdout(predicate::str::contains("pong"));

    fleetd()
        .arg("ctl")
        .arg("--socket")
        .arg(&socket)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"alpha\""));

    fleetd()
        .arg("ctl")
        .arg("--socket")
        .arg(&socket)
        .arg("shutdown")
        .assert()
        .success();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("failed to poll fleetd") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("fleetd did not exit after shutdown");
        }
        thread::sleep(Duration::from_millis(50));
    };

    assert!(status.success());
    assert!(!socket.exists());
    wait_for_process_exit(alpha as u32);
}
