//! Launching server lifecycle commands and signalling server processes.
use std::{
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use strum_macros::{Display, IntoStaticStr};
use tracing::{debug, error, info};

use crate::{
    constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG},
    error::{FleetError, ProbeError},
};

/// Which configured command is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Start,
    Restart,
    Stop,
}

/// Side effects the supervisor performs on the outside world.
pub trait ProcessControl: Send + Sync {
    /// Runs `command` as a detached background action; does not wait for it.
    fn launch(&self, server: &str, action: Action, command: &str) -> Result<(), FleetError>;

    /// Delivers an unconditional SIGKILL. A pid that is already gone is not an error.
    fn hard_kill(&self, pid: i32) -> Result<(), ProbeError>;
}

/// Runs commands through `sh -c` in their own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellControl;

impl ProcessControl for ShellControl {
    fn launch(&self, server: &str, action: Action, command: &str) -> Result<(), FleetError> {
        info!("Launching {action} command for '{server}': {command}");

        let mut child = Command::new(DEFAULT_SHELL)
            .arg(SHELL_COMMAND_FLAG)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| FleetError::LaunchError {
                server: server.to_string(),
                action: action.into(),
                source,
            })?;

        // Reap the shell so finished commands do not linger as zombies.
        let label = format!("{server}.{action}");
        let reaper = thread::Builder::new()
            .name(format!("reap-{label}"))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => debug!("Command '{label}' finished"),
                Ok(status) => debug!("Command '{label}' exited with {status}"),
                Err(err) => error!("Failed to wait for command '{label}': {err}"),
            });
        if let Err(err) = reaper {
            error!("Failed to spawn reaper thread for '{server}': {err}");
        }

        Ok(())
    }

    fn hard_kill(&self, pid: i32) -> Result<(), ProbeError> {
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProbeError::Signal { pid, source }),
        }
    }
}
