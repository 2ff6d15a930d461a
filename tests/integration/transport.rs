use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use fleetd::{
    config::SupervisorSettings,
    control::{self, ControlClient, ControlCommand},
    exceptions::ExceptionSource,
    ipc::{
        Arg, ConnectionManager, ConnectionSettings, ConnectionState, ControlError, ControlServer,
        Message, RawCommand,
    },
    launcher::Action,
    registry::{ServerRegistry, ServerSpec},
    supervisor::Supervisor,
    test_utils::{FakeHost, wait_until},
};
use tempfile::tempdir;

const CLASS: u16 = 0x0010;

fn quick() -> ConnectionSettings {
    ConnectionSettings {
        call_timeout: Duration::from_millis(500),
        wait_slice: Duration::from_millis(20),
        reconnect_poll: Duration::from_millis(20),
        receive_poll: Duration::from_millis(20),
    }
}

/// Replies to every request by echoing its arguments back.
fn echo_server(path: &Path) -> ControlServer {
    ControlServer::bind(path, |message| {
        (message.request_id != 0).then(|| {
            let mut reply = message.reply();
            reply.int_args = message.int_args.clone();
            reply.char_args = message.char_args.clone();
            reply
        })
    })
    .expect("failed to bind echo server")
}

#[test]
fn call_round_trips_through_control_server() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("echo.sock");
    let _server = echo_server(&path);

    let manager = ConnectionManager::<RawCommand>::with_settings(&path, CLASS, quick()).unwrap();
    let reply = manager
        .call(
            RawCommand(0x21),
            vec![7, -7],
            vec![b"".to_vec(), b"volume".to_vec()],
        )
        .expect("call should succeed");

    assert_eq!(reply.class_id(), CLASS);
    assert_eq!(reply.command_id(), 0x21);
    assert_eq!(reply.int_args, vec![7, -7]);
    assert_eq!(reply.char_args, vec![b"".to_vec(), b"volume".to_vec()]);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[test]
fn replies_dispatch_registered_callbacks_in_order() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("callbacks.sock");
    let _server = echo_server(&path);

    let manager = ConnectionManager::<RawCommand>::with_settings(&path, CLASS, quick()).unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    for tag in ["first", "second", "third"] {
        let seen = Arc::clone(&seen);
        manager.on(RawCommand(5), move |args| {
            let rendered = args
                .iter()
                .map(|arg| match arg {
                    Arg::Int(value) => value.to_string(),
                    Arg::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                })
                .collect::<Vec<_>>()
                .join(",");
            seen.lock().unwrap().push(format!("{tag}:{rendered}"));
        });
    }

    manager
        .call(RawCommand(5), vec![1], vec![b"x".to_vec()])
        .expect("call should succeed");

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first:1,x", "second:1,x", "third:1,x"]
    );
}

#[test]
fn missing_endpoint_is_not_available() {
    let temp = tempdir().expect("failed to create tempdir");
    let manager = ConnectionManager::<RawCommand>::with_settings(
        temp.path().join("absent.sock"),
        CLASS,
        quick(),
    )
    .unwrap();

    assert!(matches!(
        manager.call(RawCommand(1), vec![], vec![]),
        Err(ControlError::NotAvailable)
    ));
}

#[test]
fn unanswered_call_times_out() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("mute.sock");
    let _server = ControlServer::bind(&path, |_| None).unwrap();

    let manager = ConnectionManager::<RawCommand>::with_settings(&path, CLASS, quick()).unwrap();
    let started = Instant::now();
    let result = manager.call(RawCommand(3), vec![], vec![]);

    assert!(matches!(result, Err(ControlError::NoResponse)));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn connection_heals_after_endpoint_returns() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("flaky.sock");
    let mut server = echo_server(&path);

    let manager = ConnectionManager::<RawCommand>::with_settings(&path, CLASS, quick()).unwrap();
    manager.call(RawCommand(1), vec![1], vec![]).unwrap();

    server.shutdown();
    assert!(wait_until(Duration::from_secs(5), || {
        manager.state() == ConnectionState::Disconnected
    }));
    assert!(matches!(
        manager.call(RawCommand(1), vec![], vec![]),
        Err(ControlError::NotAvailable)
    ));

    let _server = echo_server(&path);
    assert!(wait_until(Duration::from_secs(5), || {
        manager.state() == ConnectionState::Connected
    }));
    let reply = manager.call(RawCommand(1), vec![2], vec![]).unwrap();
    assert_eq!(reply.int_args, vec![2]);
}

#[test]
fn fire_and_forget_send_reaches_server() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("sink.sock");
    let received: Arc<Mutex<Vec<Message>>> = Arc::default();
    let _server = {
        let received = Arc::clone(&received);
        ControlServer::bind(&path, move |message| {
            received.lock().unwrap().push(message.clone());
            None
        })
        .unwrap()
    };

    let manager = ConnectionManager::<RawCommand>::with_settings(&path, CLASS, quick()).unwrap();
    manager
        .send(RawCommand(8), vec![3], vec![b"note".to_vec()])
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !received.lock().unwrap().is_empty()));
    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.request_id, 0);
    assert_eq!(message.command_id(), 8);
    assert_eq!(message.str_arg(0).as_deref(), Some("note"));
}

#[test]
fn supervisor_control_channel_end_to_end() {
    let temp = tempdir().expect("failed to create tempdir");
    let path = temp.path().join("fleetd.sock");
    let host = FakeHost::new();
    let registry = ServerRegistry::from_specs(vec![
        ServerSpec::new("audio", temp.path().join("audio.pid"), "/bin/audio")
            .with_cascade(&["ui"]),
        ServerSpec::new("ui", temp.path().join("ui.pid"), "/bin/ui"),
    ])
    .unwrap();
    let mut supervisor = Supervisor::new(
        registry,
        ExceptionSource::default(),
        SupervisorSettings::default(),
        host.clone(),
        host.clone(),
    );
    let handle = supervisor.handle();
    let _server = control::serve(&path, handle.clone()).unwrap();

    let client = ControlClient::with_settings(&path, quick()).unwrap();
    client.ping().expect("ping should succeed");

    let status = client.status().expect("status should decode");
    let names: Vec<_> = status.servers.iter().map(|server| server.name.as_str()).collect();
    assert_eq!(names, vec!["audio", "ui"]);

    assert!(matches!(
        client.restart("video"),
        Err(ControlError::Server(_))
    ));
    client.restart("audio").expect("restart should be queued");
    let report = supervisor.tick();
    assert_eq!(report.restarted, vec!["audio", "ui"]);
    assert_eq!(host.launches(Action::Restart), vec!["audio", "ui"]);

    client.shutdown().expect("shutdown should be acknowledged");
    assert!(!handle.is_checking());

    let raw = client
        .manager()
        .call(ControlCommand::Ping, vec![], vec![])
        .unwrap();
    assert_eq!(raw.str_arg(0).as_deref(), Some("pong"));
}
