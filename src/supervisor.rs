use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, SupervisorSettings},
    constants::SLEEP_SLICE,
    error::FleetError,
    exceptions::ExceptionSource,
    launcher::{Action, ProcessControl, ShellControl},
    pidfile,
    probe::{self, Liveness, ProcessProbe, SystemProbe},
    registry::ServerRegistry,
};

/// Work queued for the supervisor loop by the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Restart the named server and its cascade.
    Restart(String),
    /// Leave the check loop; the caller then runs [`Supervisor::shutdown_all`].
    Shutdown,
}

/// Last observed state of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub pid: Option<i32>,
    pub running: bool,
    pub excepted: bool,
    pub restarts: u64,
    pub last_restart: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub rss_bytes: Option<u64>,
}

/// Fleet-wide view published after every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub checking: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub servers: Vec<ServerStatus>,
}

/// What a single supervisor tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Servers found not running correctly.
    pub failed: Vec<String>,
    /// Servers whose restart command was launched, in launch order.
    pub restarted: Vec<String>,
    /// Excepted servers whose stop command was launched.
    pub stopped: Vec<String>,
    /// Servers whose sample crossed a CPU or memory limit.
    pub over_limit: Vec<String>,
}

/// Outcome of [`Supervisor::shutdown_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Pids recorded when the stop commands were issued. A pid whose process no
    /// longer runs the server's command is left out.
    pub tracked: Vec<i32>,
    /// Number of SIGKILL sweeps performed.
    pub kill_rounds: u32,
    /// Pids still alive when a configured attempt bound ran out.
    pub survivors: Vec<i32>,
}

#[derive(Debug, Clone, Default)]
struct RestartRecord {
    count: u64,
    last: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct Observation {
    pid: Option<i32>,
    running: bool,
    cpu_percent: Option<f64>,
}

/// Cloneable handle for code outside the supervisor loop: signal handlers and the
/// control channel.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    checking: Arc<AtomicBool>,
    requests: Sender<ControlRequest>,
    status: Arc<RwLock<StatusSnapshot>>,
}

impl SupervisorHandle {
    /// Clears the checking flag; the loop exits at its next tick boundary.
    pub fn stop(&self) {
        self.checking.store(false, Ordering::SeqCst);
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    /// Queues a cascade restart of `name`. Returns false once the supervisor is gone.
    pub fn request_restart(&self, name: &str) -> bool {
        self.requests
            .send(ControlRequest::Restart(name.to_string()))
            .is_ok()
    }

    /// Queues a shutdown request and clears the checking flag.
    pub fn request_shutdown(&self) {
        let _ = self.requests.send(ControlRequest::Shutdown);
        self.stop();
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// True when the last published snapshot knows a server named `name`.
    pub fn knows(&self, name: &str) -> bool {
        self.status().servers.iter().any(|server| server.name == name)
    }
}

/// Watches every configured server, restarting failed ones together with the
/// servers that cascade from them.
pub struct Supervisor {
    registry: ServerRegistry,
    exceptions: ExceptionSource,
    probe: Arc<dyn ProcessProbe>,
    control: Arc<dyn ProcessControl>,
    settings: SupervisorSettings,
    checking: Arc<AtomicBool>,
    request_tx: Sender<ControlRequest>,
    requests: Receiver<ControlRequest>,
    status: Arc<RwLock<StatusSnapshot>>,
    restarts: BTreeMap<String, RestartRecord>,
}

impl Supervisor {
    pub fn new(
        registry: ServerRegistry,
        exceptions: ExceptionSource,
        settings: SupervisorSettings,
        probe: Arc<dyn ProcessProbe>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        for cycle in registry.cycles() {
            warn!("Cascade cycle detected: {}", cycle.join(" -> "));
        }
        let (request_tx, requests) = mpsc::channel();
        let supervisor = Self {
            registry,
            exceptions,
            probe,
            control,
            settings,
            checking: Arc::new(AtomicBool::new(true)),
            request_tx,
            requests,
            status: Arc::new(RwLock::new(StatusSnapshot::default())),
            restarts: BTreeMap::new(),
        };
        supervisor.publish(&BTreeMap::new());
        supervisor
    }

    /// Builds a supervisor acting on the real process table through `sh`.
    pub fn from_config(config: &Config) -> Result<Self, FleetError> {
        let registry = ServerRegistry::from_config(config)?;
        let settings = config.supervisor.resolve()?;
        let exceptions = ExceptionSource::from_path(config.exceptions_file.clone());
        Ok(Self::new(
            registry,
            exceptions,
            settings,
            Arc::new(SystemProbe::new()),
            Arc::new(ShellControl),
        ))
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            checking: Arc::clone(&self.checking),
            requests: self.request_tx.clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    /// Launches every non-excepted server in fleet order, honouring start delays.
    /// Returns the servers launched.
    pub fn start(&mut self) -> Vec<String> {
        let order = self.registry.start_order();
        info!("Starting fleet in order: [{}]", order.join(", "));

        let mut launched = Vec::new();
        for name in order {
            if self.exceptions.current().contains(&name) {
                info!("Skipping start of excepted server '{name}'");
                continue;
            }
            let Some(spec) = self.registry.get(&name) else {
                continue;
            };
            let (action, command) = match &spec.start_command {
                Some(command) => (Action::Start, command.clone()),
                None => (Action::Restart, spec.restart_command.clone()),
            };
            let delay = spec.start_delay;

            match self.control.launch(&name, action, &command) {
                Ok(()) => launched.push(name.clone()),
                Err(err) => error!("Failed to start '{name}': {err}"),
            }
            if let Some(delay) = delay {
                debug!("Waiting {delay:?} after starting '{name}'");
                thread::sleep(delay);
            }
        }
        launched
    }

    /// Runs one supervision pass over every server.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let mut restarted = BTreeSet::new();
        self.drain_requests(&mut report, &mut restarted);
        if !self.is_checking() {
            return report;
        }

        let now = Instant::now();
        let mut observed = BTreeMap::new();
        for name in self.registry.names() {
            let Some(spec) = self.registry.get_mut(&name) else {
                continue;
            };
            let pid = pidfile::read_pid(&spec.pid_file);
            let expected = spec.expected_cmdline_prefix.clone();
            // A server restarted earlier in this tick still has the old pid on file.
            let sample = if restarted.contains(&name) {
                None
            } else {
                pid.and_then(|pid| probe::sample(self.probe.as_ref(), spec, pid, now))
            };
            if sample.is_some_and(|sample| sample.cpu_alert || sample.mem_alert) {
                report.over_limit.push(name.clone());
            }
            let stop_command = spec.stop_command.clone();

            let mut observation = Observation {
                pid,
                running: false,
                cpu_percent: sample.and_then(|sample| sample.cpu_percent),
            };

            if self.exceptions.current().contains(&name) {
                debug!("Server '{name}' is excepted; issuing stop");
                match self.control.launch(&name, Action::Stop, &stop_command) {
                    Ok(()) => report.stopped.push(name.clone()),
                    Err(err) => error!("Failed to stop excepted server '{name}': {err}"),
                }
                observation.running = pid.is_some_and(|pid| self.probe.is_alive(pid));
                observed.insert(name, observation);
                continue;
            }

            let liveness = match pid {
                Some(pid) => probe::matches(self.probe.as_ref(), &name, pid, &expected),
                None => {
                    warn!("Server '{name}' has no usable pid file");
                    Liveness::NotRunning
                }
            };
            observation.running = liveness.is_running();
            observed.insert(name.clone(), observation);

            if !liveness.is_running() {
                report.failed.push(name.clone());
                if restarted.contains(&name) {
                    debug!("'{name}' was already restarted during this tick");
                    continue;
                }
                report
                    .restarted
                    .extend(self.cascade(&name, &mut restarted));
            }
        }

        self.publish(&observed);
        report
    }

    /// Restarts `name` and every server in its cascade closure.
    pub fn restart_cascade(&mut self, name: &str) -> Result<Vec<String>, FleetError> {
        if !self.registry.contains(name) {
            return Err(FleetError::UnknownServer(name.to_string()));
        }
        Ok(self.cascade(name, &mut BTreeSet::new()))
    }

    fn cascade(&mut self, root: &str, restarted: &mut BTreeSet<String>) -> Vec<String> {
        let members = self
            .registry
            .get(root)
            .map(|spec| spec.restart_closure.clone())
            .unwrap_or_default();
        info!("Restarting '{root}' with cascade [{}]", members.join(", "));

        let mut launched = Vec::new();
        for member in members {
            if self.exceptions.current().contains(&member) {
                debug!("Not restarting excepted server '{member}'");
                continue;
            }
            if !restarted.insert(member.clone()) {
                continue;
            }
            let Some(spec) = self.registry.get_mut(&member) else {
                continue;
            };
            spec.sample = None;
            let command = spec.restart_command.clone();
            let delay = spec.start_delay;

            match self.control.launch(&member, Action::Restart, &command) {
                Ok(()) => {
                    let record = self.restarts.entry(member.clone()).or_default();
                    record.count += 1;
                    record.last = Some(Utc::now());
                    launched.push(member.clone());
                }
                Err(err) => error!("Failed to restart '{member}': {err}"),
            }
            if let Some(delay) = delay {
                debug!("Waiting {delay:?} after restarting '{member}'");
                thread::sleep(delay);
            }
        }
        launched
    }

    fn drain_requests(&mut self, report: &mut TickReport, restarted: &mut BTreeSet<String>) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                ControlRequest::Restart(name) if self.registry.contains(&name) => {
                    info!("Restart of '{name}' requested over the control channel");
                    report.restarted.extend(self.cascade(&name, restarted));
                }
                ControlRequest::Restart(name) => {
                    warn!("Ignoring restart request for unknown server '{name}'");
                }
                ControlRequest::Shutdown => {
                    info!("Shutdown requested over the control channel");
                    self.checking.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Ticks until the checking flag is cleared, sleeping the tick interval in
    /// between and re-reading the exception set after every sleep.
    pub fn check_and_restart(&mut self) {
        info!(
            "Supervising {} servers every {:?}",
            self.registry.len(),
            self.settings.tick_interval
        );
        while self.is_checking() {
            self.tick();
            if !self.sleep_while_checking(self.settings.tick_interval) {
                break;
            }
            self.exceptions.reload();
        }
        info!("Supervisor check loop stopped");
    }

    fn sleep_while_checking(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_checking() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
        false
    }

    /// Stops every server, then SIGKILLs whatever the stop commands left alive.
    ///
    /// Without `max_kill_attempts` the kill sweep repeats until every tracked pid is
    /// gone.
    pub fn shutdown_all(&mut self) -> ShutdownReport {
        self.checking.store(false, Ordering::SeqCst);
        info!("Stopping all {} servers", self.registry.len());

        let mut tracked = Vec::new();
        for spec in self.registry.iter() {
            // Only pids still running the server's command are eligible for SIGKILL.
            if let Some(pid) = pidfile::read_pid(&spec.pid_file) {
                match probe::matches(
                    self.probe.as_ref(),
                    &spec.name,
                    pid,
                    &spec.expected_cmdline_prefix,
                ) {
                    Liveness::Running => tracked.push((spec.name.clone(), pid)),
                    _ => debug!("Not tracking PID {pid} of '{}' for shutdown", spec.name),
                }
            }
            if let Err(err) = self
                .control
                .launch(&spec.name, Action::Stop, &spec.stop_command)
            {
                error!("Failed to stop '{}': {err}", spec.name);
            }
        }

        let mut report = ShutdownReport {
            tracked: tracked.iter().map(|(_, pid)| *pid).collect(),
            ..ShutdownReport::default()
        };

        debug!("Waiting {:?} for servers to exit", self.settings.shutdown_settle);
        thread::sleep(self.settings.shutdown_settle);

        loop {
            tracked.retain(|(name, pid)| {
                let alive = self.probe.is_alive(*pid);
                if !alive {
                    info!("Server '{name}' (PID {pid}) has exited");
                }
                alive
            });
            if tracked.is_empty() {
                break;
            }
            if let Some(max) = self.settings.max_kill_attempts
                && report.kill_rounds >= max
            {
                error!(
                    "Giving up after {max} kill attempts; still alive: {:?}",
                    tracked.iter().map(|(_, pid)| *pid).collect::<Vec<_>>()
                );
                break;
            }

            report.kill_rounds += 1;
            for (name, pid) in &tracked {
                warn!("Server '{name}' (PID {pid}) survived its stop command; sending SIGKILL");
                if let Err(err) = self.control.hard_kill(*pid) {
                    error!("Failed to kill '{name}' (PID {pid}): {err}");
                }
            }
            thread::sleep(self.settings.kill_retry_interval);
        }

        report.survivors = tracked.into_iter().map(|(_, pid)| pid).collect();
        self.publish(&BTreeMap::new());
        report
    }

    fn publish(&self, observed: &BTreeMap<String, Observation>) {
        let servers = self
            .registry
            .iter()
            .map(|spec| {
                let observation = observed.get(&spec.name).cloned().unwrap_or_default();
                let restarts = self.restarts.get(&spec.name).cloned().unwrap_or_default();
                ServerStatus {
                    name: spec.name.clone(),
                    pid: observation.pid,
                    running: observation.running,
                    excepted: self.exceptions.current().contains(&spec.name),
                    restarts: restarts.count,
                    last_restart: restarts.last,
                    cpu_percent: observation.cpu_percent,
                    rss_bytes: spec.sample.map(|sample| sample.rss_bytes),
                }
            })
            .collect();

        let snapshot = StatusSnapshot {
            checking: self.is_checking(),
            updated_at: Some(Utc::now()),
            servers,
        };
        match self.status.write() {
            Ok(mut status) => *status = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}
