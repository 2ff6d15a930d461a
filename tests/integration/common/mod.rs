#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fleetd::probe::{ProcessProbe, SystemProbe};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid as NixPid,
};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Writes `body` as `fleetd.yaml` inside `dir` and returns its path.
pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fleetd.yaml");
    fs::write(&path, body).expect("failed to write config");
    path
}

/// Config body for one server backed by a real `sleep` process.
///
/// The restart command replaces any previous instance and records the new pid; the
/// stop command kills whatever pid is recorded.
pub fn sleep_server(dir: &Path, name: &str, seconds: u32, cascade: &[&str]) -> String {
    let pid_file = dir.join(format!("{name}.pid"));
    let pid_file = pid_file.display();
    format!(
        r#"  {name}:
    pid_file: "{pid_file}"
    cmdline: "sleep {seconds}"
    restart: "kill $(cat {pid_file}) 2>/dev/null; sleep {seconds} & echo $! > {pid_file}.tmp && mv {pid_file}.tmp {pid_file}"
    stop: "kill $(cat {pid_file}) 2>/dev/null"
    cascade: [{cascade}]
"#,
        cascade = cascade.join(", ")
    )
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Waits until the pid file at `path` names a pid other than `previous`.
pub fn wait_for_new_pid(path: &Path, previous: Option<i32>) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = read_pid(path)
            && Some(pid) != previous
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a new pid in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until `pid` has exec'd into a command line starting with `prefix`.
pub fn wait_for_cmdline(pid: i32, prefix: &str) {
    let probe = SystemProbe::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let cmdline = probe.read_cmdline(pid).unwrap_or_default();
        if cmdline.starts_with(prefix) {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for PID {pid} to run '{prefix}' (saw '{cmdline}')");
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}

/// SIGKILLs `pid`, ignoring processes that are already gone.
pub fn kill(pid: i32) {
    let _ = signal::kill(NixPid::from_raw(pid), Signal::SIGKILL);
}

/// Kills every pid recorded in the given pid files when dropped.
pub struct PidCleanup(pub Vec<PathBuf>);

impl Drop for PidCleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Some(pid) = read_pid(path) {
                kill(pid);
            }
        }
    }
}
