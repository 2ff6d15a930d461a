//! Error handling for fleetd.
use thiserror::Error;

/// Defines the errors raised while loading the fleet and running the supervisor.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value could not be interpreted.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration references an environment variable that is not set.
    #[error("Missing environment variable '{0}' referenced by config")]
    MissingEnvVar(String),

    /// A server cascades into a server that is not defined.
    #[error("Server '{server}' cascades into unknown server '{target}'")]
    UnknownCascadeTarget {
        /// The server declaring the cascade.
        server: String,
        /// The undefined cascade target.
        target: String,
    },

    /// A command referenced a server name the registry does not know.
    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    /// Error launching a shell command for a server.
    #[error("Failed to launch {action} command for '{server}': {source}")]
    LaunchError {
        /// The server whose command failed to launch.
        server: String,
        /// Which lifecycle action was being launched.
        action: &'static str,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error from the control channel.
    #[error(transparent)]
    Control(#[from] crate::ipc::ControlError),
}

impl<T> From<std::sync::PoisonError<T>> for FleetError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        FleetError::MutexPoisonError(err.to_string())
    }
}

/// Errors raised while inspecting a process.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The process table has no usable entry for the pid.
    #[error("No such process: {0}")]
    NoSuchProcess(i32),

    /// A process table file existed but could not be parsed.
    #[error("Malformed process entry for PID {pid}: {reason}")]
    Malformed {
        /// The pid whose entry was malformed.
        pid: i32,
        /// What was wrong with it.
        reason: String,
    },

    /// Error reading from the process table.
    #[error("Failed to read process table: {0}")]
    Io(#[from] std::io::Error),

    /// Error delivering a signal.
    #[error("Failed to signal PID {pid}: {source}")]
    Signal {
        /// The pid that was targeted.
        pid: i32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}
