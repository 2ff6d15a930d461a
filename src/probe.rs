//! Process inspection: liveness, identity and resource usage of a pid.
#[cfg(target_os = "linux")]
use std::{fs, io::ErrorKind, path::Path};
use std::time::Instant;
#[cfg(not(target_os = "linux"))]
use std::sync::Mutex;

#[cfg(not(target_os = "linux"))]
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::{
    error::ProbeError,
    registry::{ResourceSample, ServerSpec},
};

/// Cumulative resource counters of a process at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCounters {
    /// User-mode clock ticks; `None` where the platform does not expose them.
    pub user_ticks: Option<u64>,
    /// Kernel-mode clock ticks; `None` where the platform does not expose them.
    pub system_ticks: Option<u64>,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// OS-facing view of the process table.
pub trait ProcessProbe: Send + Sync {
    /// True when a process table entry exists for `pid` and it is not a zombie.
    fn is_alive(&self, pid: i32) -> bool;

    /// The sanitized command line the process was started with.
    fn read_cmdline(&self, pid: i32) -> Result<String, ProbeError>;

    /// Current cumulative CPU ticks and resident memory.
    fn read_usage(&self, pid: i32) -> Result<UsageCounters, ProbeError>;

    /// Scheduler clock ticks per second used to convert tick deltas into seconds.
    fn clock_ticks_per_second(&self) -> u64 {
        100
    }
}

/// Outcome of checking a server's pid against its expected identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Alive and started with the expected command.
    Running,
    /// No pid file, or no live process behind the pid.
    NotRunning,
    /// A live process whose command line does not carry the expected prefix.
    WrongCommand { actual: String },
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running)
    }
}

/// Checks that `pid` is alive and was started with a command beginning with
/// `expected_prefix`. Failures are logged against `server`.
pub fn matches(
    probe: &dyn ProcessProbe,
    server: &str,
    pid: i32,
    expected_prefix: &str,
) -> Liveness {
    if !probe.is_alive(pid) {
        warn!("Server '{server}' is not running: PID {pid} is gone");
        return Liveness::NotRunning;
    }

    match probe.read_cmdline(pid) {
        Ok(actual) if actual.starts_with(expected_prefix) => Liveness::Running,
        Ok(actual) => {
            warn!(
                "Server '{server}' PID {pid} runs '{actual}', expected a command starting with '{expected_prefix}'"
            );
            Liveness::WrongCommand { actual }
        }
        Err(err) => {
            warn!("Server '{server}' PID {pid}: cannot read command line: {err}");
            Liveness::NotRunning
        }
    }
}

/// What one resource sample observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleReport {
    /// CPU usage since the previous sample, if both samples carried tick counts.
    pub cpu_percent: Option<f64>,
    pub rss_bytes: u64,
    /// A CPU threshold warning was emitted.
    pub cpu_alert: bool,
    /// A memory threshold warning was emitted.
    pub mem_alert: bool,
}

/// CPU percentage between two samples: `((Δuser + Δsystem) / ticks_per_sec) / Δwall × 100`.
pub fn cpu_percent(
    previous: &ResourceSample,
    current: &UsageCounters,
    now: Instant,
    ticks_per_second: u64,
) -> Option<f64> {
    let elapsed = now.checked_duration_since(previous.taken_at)?.as_secs_f64();
    if elapsed <= 0.0 || ticks_per_second == 0 {
        return None;
    }

    let user = current.user_ticks?.saturating_sub(previous.user_ticks?);
    let system = current.system_ticks?.saturating_sub(previous.system_ticks?);
    let cpu_seconds = (user + system) as f64 / ticks_per_second as f64;
    Some(cpu_seconds / elapsed * 100.0)
}

/// Samples `pid` on behalf of `spec`, logs threshold violations and stores the sample.
///
/// Memory warnings fire only when the resident size changed since the previous
/// sample, so a process sitting steadily above its limit is reported once.
pub fn sample(
    probe: &dyn ProcessProbe,
    spec: &mut ServerSpec,
    pid: i32,
    now: Instant,
) -> Option<SampleReport> {
    let counters = match probe.read_usage(pid) {
        Ok(counters) => counters,
        Err(err) => {
            debug!("Could not sample '{}' (PID {pid}): {err}", spec.name);
            return None;
        }
    };

    let previous = spec.sample;
    let cpu = previous.as_ref().and_then(|prev| {
        cpu_percent(prev, &counters, now, probe.clock_ticks_per_second())
    });

    let mut report = SampleReport {
        cpu_percent: cpu,
        rss_bytes: counters.rss_bytes,
        cpu_alert: false,
        mem_alert: false,
    };

    if let (Some(limit), Some(cpu)) = (spec.max_cpu_percent, cpu)
        && cpu > limit
    {
        warn!(
            "Server '{}' (PID {pid}) uses {cpu:.1}% CPU, above its {limit:.1}% limit",
            spec.name
        );
        report.cpu_alert = true;
    }

    if let Some(limit) = spec.max_mem_bytes
        && counters.rss_bytes > limit
        && previous.is_none_or(|prev| prev.rss_bytes != counters.rss_bytes)
    {
        warn!(
            "Server '{}' (PID {pid}) resident memory {} bytes exceeds its {limit} byte limit",
            spec.name, counters.rss_bytes
        );
        report.mem_alert = true;
    }

    spec.sample = Some(ResourceSample {
        user_ticks: counters.user_ticks,
        system_ticks: counters.system_ticks,
        rss_bytes: counters.rss_bytes,
        taken_at: now,
    });

    Some(report)
}

/// Replaces NUL argument separators with spaces and drops other non-printable bytes.
pub fn sanitize_cmdline(raw: &[u8]) -> String {
    let cleaned: Vec<u8> = raw
        .iter()
        .filter_map(|byte| match *byte {
            0 => Some(b' '),
            b if b < 0x20 || b == 0x7f => None,
            b => Some(b),
        })
        .collect();
    String::from_utf8_lossy(&cleaned).trim().to_string()
}

/// Fields of `/proc/<pid>/stat` the probe cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: u64,
}

/// Parses a `/proc/<pid>/stat` line. The command name is wrapped in parentheses and
/// may itself contain spaces or parentheses, so fields are counted from the last `)`.
pub fn parse_proc_stat(contents: &str) -> Option<ProcStat> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Probe backed by the running kernel.
pub struct SystemProbe {
    clock_ticks: u64,
    #[cfg(target_os = "linux")]
    page_size: u64,
    #[cfg(not(target_os = "linux"))]
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            #[cfg(target_os = "linux")]
            page_size: {
                let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if size > 0 { size as u64 } else { 4096 }
            },
            #[cfg(not(target_os = "linux"))]
            system: Mutex::new(System::new()),
        }
    }

    #[cfg(target_os = "linux")]
    fn read_stat(&self, pid: i32) -> Result<ProcStat, ProbeError> {
        let path = format!("/proc/{pid}/stat");
        let contents = fs::read_to_string(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ProbeError::NoSuchProcess(pid),
            _ => ProbeError::Io(err),
        })?;
        parse_proc_stat(&contents).ok_or_else(|| ProbeError::Malformed {
            pid,
            reason: format!("unexpected contents of {path}"),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn with_process<T>(
        &self,
        pid: i32,
        inspect: impl FnOnce(&sysinfo::Process) -> T,
    ) -> Option<T> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let target = sysinfo::Pid::from_u32(pid as u32);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(target).map(inspect)
    }
}

#[cfg(target_os = "linux")]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 || !Path::new(&format!("/proc/{pid}")).exists() {
            return false;
        }
        match self.read_stat(pid) {
            Ok(stat) => !matches!(stat.state, 'Z' | 'X' | 'x'),
            Err(_) => false,
        }
    }

    fn read_cmdline(&self, pid: i32) -> Result<String, ProbeError> {
        let raw = fs::read(format!("/proc/{pid}/cmdline")).map_err(|err| {
            match err.kind() {
                ErrorKind::NotFound => ProbeError::NoSuchProcess(pid),
                _ => ProbeError::Io(err),
            }
        })?;
        Ok(sanitize_cmdline(&raw))
    }

    fn read_usage(&self, pid: i32) -> Result<UsageCounters, ProbeError> {
        let stat = self.read_stat(pid)?;
        Ok(UsageCounters {
            user_ticks: Some(stat.utime),
            system_ticks: Some(stat.stime),
            rss_bytes: stat.rss_pages.saturating_mul(self.page_size),
        })
    }

    fn clock_ticks_per_second(&self) -> u64 {
        self.clock_ticks
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: i32) -> bool {
        pid > 0
            && self
                .with_process(pid, |process| {
                    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                })
                .unwrap_or(false)
    }

    fn read_cmdline(&self, pid: i32) -> Result<String, ProbeError> {
        self.with_process(pid, |process| {
            let joined = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("\0");
            sanitize_cmdline(joined.as_bytes())
        })
        .ok_or(ProbeError::NoSuchProcess(pid))
    }

    fn read_usage(&self, pid: i32) -> Result<UsageCounters, ProbeError> {
        self.with_process(pid, |process| UsageCounters {
            user_ticks: None,
            system_ticks: None,
            rss_bytes: process.memory(),
        })
        .ok_or(ProbeError::NoSuchProcess(pid))
    }

    fn clock_ticks_per_second(&self) -> u64 {
        self.clock_ticks
    }
}
