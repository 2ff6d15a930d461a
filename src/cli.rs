//! Command-line interface for fleetd.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for fleetd.
#[derive(Parser)]
#[command(name = "fleetd", version, author)]
#[command(about = "Supervisor for a fleet of cooperating manager daemons", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for fleetd.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the fleet and supervise it until interrupted or told to shut down.
    Run {
        /// Path to the configuration file (defaults to `fleetd.yaml`).
        #[arg(short, long, default_value = "fleetd.yaml")]
        config: String,

        /// Supervise servers that are already running instead of starting the fleet.
        #[arg(long)]
        no_start: bool,
    },

    /// Validate a configuration file and report cascade cycles.
    Check {
        /// Path to the configuration file (defaults to `fleetd.yaml`).
        #[arg(short, long, default_value = "fleetd.yaml")]
        config: String,
    },

    /// Print the fleet start order, or the restart cascade of one server.
    Order {
        /// Path to the configuration file (defaults to `fleetd.yaml`).
        #[arg(short, long, default_value = "fleetd.yaml")]
        config: String,

        /// Print the ordered restart cascade of this server instead.
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Talk to a running supervisor over its control socket.
    Ctl {
        /// Control socket path (defaults to `~/.local/share/fleetd/control.sock`).
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: CtlAction,
    },
}

/// Requests understood by the supervisor control channel.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CtlAction {
    /// Check that the supervisor answers.
    Ping,
    /// Print the supervisor's status snapshot.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Restart a server together with its cascade.
    Restart {
        /// Name of the server to restart.
        name: String,
    },
    /// Stop every server and exit the supervisor.
    Shutdown,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
