//! Helpers shared by unit and integration tests.
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{FleetError, ProbeError},
    launcher::{Action, ProcessControl},
    probe::{ProcessProbe, UsageCounters},
};

/// Something the fake host was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Launch { server: String, action: Action },
    Kill(i32),
}

#[derive(Debug, Default)]
struct HostState {
    processes: HashMap<i32, String>,
    usage: HashMap<i32, UsageCounters>,
    unkillable: HashSet<i32>,
    exit_on_stop: HashMap<String, i32>,
    events: Vec<HostEvent>,
}

/// In-memory process table that records every launch and kill instead of touching
/// the real system. Implements both [`ProcessProbe`] and [`ProcessControl`].
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a live process.
    pub fn spawn(&self, pid: i32, cmdline: &str) {
        self.lock().processes.insert(pid, cmdline.to_string());
    }

    /// Removes a process as if it exited.
    pub fn exit(&self, pid: i32) {
        let mut state = self.lock();
        state.processes.remove(&pid);
        state.usage.remove(&pid);
    }

    pub fn set_usage(&self, pid: i32, usage: UsageCounters) {
        self.lock().usage.insert(pid, usage);
    }

    /// SIGKILL attempts on `pid` are recorded but the process survives them.
    pub fn make_unkillable(&self, pid: i32) {
        self.lock().unkillable.insert(pid);
    }

    /// Launching the stop command of `server` makes `pid` exit.
    pub fn exit_on_stop(&self, server: &str, pid: i32) {
        self.lock().exit_on_stop.insert(server.to_string(), pid);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Servers for which `action` was launched, in launch order.
    pub fn launches(&self, action: Action) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                HostEvent::Launch {
                    server,
                    action: launched,
                } if *launched == action => Some(server.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn kill_count(&self, pid: i32) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| **event == HostEvent::Kill(pid))
            .count()
    }
}

impl ProcessProbe for FakeHost {
    fn is_alive(&self, pid: i32) -> bool {
        self.lock().processes.contains_key(&pid)
    }

    fn read_cmdline(&self, pid: i32) -> Result<String, ProbeError> {
        self.lock()
            .processes
            .get(&pid)
            .cloned()
            .ok_or(ProbeError::NoSuchProcess(pid))
    }

    fn read_usage(&self, pid: i32) -> Result<UsageCounters, ProbeError> {
        let state = self.lock();
        if !state.processes.contains_key(&pid) {
            return Err(ProbeError::NoSuchProcess(pid));
        }
        Ok(state.usage.get(&pid).copied().unwrap_or(UsageCounters {
            user_ticks: Some(0),
            system_ticks: Some(0),
            rss_bytes: 0,
        }))
    }
}

impl ProcessControl for FakeHost {
    fn launch(&self, server: &str, action: Action, _command: &str) -> Result<(), FleetError> {
        let mut state = self.lock();
        state.events.push(HostEvent::Launch {
            server: server.to_string(),
            action,
        });
        if action == Action::Stop
            && let Some(pid) = state.exit_on_stop.get(server).copied()
        {
            state.processes.remove(&pid);
        }
        Ok(())
    }

    fn hard_kill(&self, pid: i32) -> Result<(), ProbeError> {
        let mut state = self.lock();
        state.events.push(HostEvent::Kill(pid));
        if !state.unkillable.contains(&pid) {
            state.processes.remove(&pid);
        }
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses; returns whether it held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Waits up to five seconds for `path` to exist.
pub fn wait_for_path(path: &Path) {
    if !wait_until(Duration::from_secs(5), || path.exists()) {
        panic!("Timed out waiting for {:?} to exist", path);
    }
}
