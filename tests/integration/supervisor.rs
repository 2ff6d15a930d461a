#[path = "common/mod.rs"]
mod common;

use std::{
    fs, thread,
    time::{Duration, Instant},
};

use common::{
    PidCleanup, kill, sleep_server, wait_for_cmdline, wait_for_new_pid,
    wait_for_process_exit, write_config,
};
use fleetd::{
    config::{SupervisorSettings, load_config},
    exceptions::{ExceptionSet, ExceptionSource},
    launcher::Action,
    registry::{ServerRegistry, ServerSpec},
    supervisor::Supervisor,
    test_utils::{FakeHost, wait_until},
};
use tempfile::tempdir;

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        tick_interval: Duration::from_millis(50),
        shutdown_settle: Duration::from_millis(10),
        kill_retry_interval: Duration::from_millis(10),
        max_kill_attempts: Some(5),
    }
}

#[cfg(target_os = "linux")]
#[test]
fn restarts_killed_server_and_its_cascade() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let body = format!(
        "version: \"1\"\nsupervisor:\n  tick_interval: 50ms\n  shutdown_settle: 200ms\n  kill_retry_interval: 50ms\nservers:\n{}{}",
        sleep_server(dir, "alpha", 301, &["beta"]),
        sleep_server(dir, "beta", 302, &[]),
    );
    let config_path = write_config(dir, &body);
    let alpha_pid_file = dir.join("alpha.pid");
    let beta_pid_file = dir.join("beta.pid");
    let _cleanup = PidCleanup(vec![alpha_pid_file.clone(), beta_pid_file.clone()]);

    let config = load_config(Some(config_path.to_str().unwrap())).expect("config should load");
    let mut supervisor = Supervisor::from_config(&config).expect("supervisor should build");

    assert_eq!(supervisor.start(), vec!["alpha", "beta"]);
    let alpha = wait_for_new_pid(&alpha_pid_file, None);
    let beta = wait_for_new_pid(&beta_pid_file, None);
    wait_for_cmdline(alpha, "sleep 301");
    wait_for_cmdline(beta, "sleep 302");

    let healthy = supervisor.tick();
    assert!(healthy.failed.is_empty(), "unexpected failures: {healthy:?}");

    kill(alpha);
    wait_for_process_exit(alpha as u32);

    let report = supervisor.tick();
    // beta may look dead too while its restart command swaps the pid file.
    assert_eq!(report.failed.first().map(String::as_str), Some("alpha"));
    assert_eq!(report.restarted, vec!["alpha", "beta"]);

    let new_alpha = wait_for_new_pid(&alpha_pid_file, Some(alpha));
    let new_beta = wait_for_new_pid(&beta_pid_file, Some(beta));
    wait_for_cmdline(new_alpha, "sleep 301");
    wait_for_cmdline(new_beta, "sleep 302");
    wait_for_process_exit(beta as u32);

    let shutdown = supervisor.shutdown_all();
    assert_eq!(shutdown.tracked, vec![new_alpha, new_beta]);
    assert!(shutdown.survivors.is_empty());
    wait_for_process_exit(new_alpha as u32);
    wait_for_process_exit(new_beta as u32);
}

#[test]
fn cyclic_cascade_restarts_each_member_once() {
    let temp = tempdir().expect("failed to create tempdir");
    let host = FakeHost::new();
    let specs = vec![
        ServerSpec::new("a", temp.path().join("a.pid"), "/bin/a").with_cascade(&["b"]),
        ServerSpec::new("b", temp.path().join("b.pid"), "/bin/b").with_cascade(&["a"]),
    ];
    let registry = ServerRegistry::from_specs(specs).expect("cycles are not fatal");
    assert_eq!(registry.cycles().len(), 1);

    let mut supervisor = Supervisor::new(
        registry,
        ExceptionSource::default(),
        settings(),
        host.clone(),
        host.clone(),
    );
    let report = supervisor.tick();

    assert_eq!(report.failed, vec!["a", "b"]);
    let mut restarted = host.launches(Action::Restart);
    restarted.sort();
    assert_eq!(restarted, vec!["a", "b"]);
}

#[test]
fn exception_file_is_reread_between_ticks() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let exceptions_file = dir.join("exceptions");
    let host = FakeHost::new();

    let mut specs = Vec::new();
    for (name, pid) in [("a", 100), ("b", 200)] {
        let pid_file = dir.join(format!("{name}.pid"));
        fs::write(&pid_file, pid.to_string()).unwrap();
        host.spawn(pid, &format!("/bin/{name} --daemon"));
        specs.push(ServerSpec::new(name, pid_file, &format!("/bin/{name}")));
    }

    let mut supervisor = Supervisor::new(
        ServerRegistry::from_specs(specs).unwrap(),
        ExceptionSource::from_path(Some(exceptions_file.clone())),
        settings(),
        host.clone(),
        host.clone(),
    );
    let handle = supervisor.handle();
    let worker = thread::spawn(move || supervisor.check_and_restart());

    thread::sleep(Duration::from_millis(150));
    assert!(host.launches(Action::Stop).is_empty());

    fs::write(&exceptions_file, "b\n").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        host.launches(Action::Stop).contains(&"b".to_string())
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        handle.status().servers.iter().any(|server| server.name == "b" && server.excepted)
    }));

    handle.stop();
    worker.join().expect("check loop panicked");
    assert!(!host.launches(Action::Stop).contains(&"a".to_string()));
    assert!(host.launches(Action::Restart).is_empty());
}

#[test]
fn excepted_dependents_are_skipped_during_cascade() {
    let temp = tempdir().expect("failed to create tempdir");
    let host = FakeHost::new();
    let specs = vec![
        ServerSpec::new("core", temp.path().join("core.pid"), "/bin/core")
            .with_cascade(&["ui", "net"]),
        ServerSpec::new("net", temp.path().join("net.pid"), "/bin/net"),
        ServerSpec::new("ui", temp.path().join("ui.pid"), "/bin/ui"),
    ];
    let exceptions: ExceptionSet = ["ui".to_string()].into_iter().collect();
    let mut supervisor = Supervisor::new(
        ServerRegistry::from_specs(specs).unwrap(),
        ExceptionSource::fixed(exceptions),
        settings(),
        host.clone(),
        host.clone(),
    );

    let restarted = supervisor.restart_cascade("core").unwrap();

    assert_eq!(restarted, vec!["core", "net"]);
    assert_eq!(host.launches(Action::Restart), vec!["core", "net"]);
}

#[test]
fn start_delay_spaces_out_launches() {
    let temp = tempdir().expect("failed to create tempdir");
    let host = FakeHost::new();
    let mut slow = ServerSpec::new("slow", temp.path().join("slow.pid"), "/bin/slow");
    slow.start_delay = Some(Duration::from_millis(200));
    let fast = ServerSpec::new("zfast", temp.path().join("zfast.pid"), "/bin/zfast");

    let mut supervisor = Supervisor::new(
        ServerRegistry::from_specs(vec![slow, fast]).unwrap(),
        ExceptionSource::default(),
        settings(),
        host.clone(),
        host.clone(),
    );

    let started = Instant::now();
    assert_eq!(supervisor.start(), vec!["slow", "zfast"]);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(host.launches(Action::Restart), vec!["slow", "zfast"]);
}
