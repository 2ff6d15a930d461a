//! Configuration management for fleetd.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    constants::{DEFAULT_KILL_RETRY_INTERVAL, DEFAULT_SHUTDOWN_SETTLE, DEFAULT_TICK_INTERVAL},
    error::FleetError,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Map of server names to their respective configurations.
    pub servers: BTreeMap<String, ServerConfig>,
    /// Hand-editable file listing servers that must not be restarted.
    pub exceptions_file: Option<PathBuf>,
    /// Socket the supervisor listens on for control commands.
    pub control_socket: Option<PathBuf>,
    /// Timing knobs for the supervisor loop.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Configuration for an individual server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// File the server writes its pid into.
    pub pid_file: PathBuf,
    /// Prefix the server's recorded command line must start with.
    pub cmdline: String,
    /// Command used to start the server.
    pub start: Option<String>,
    /// Command used to restart the server.
    pub restart: String,
    /// Command used to stop the server.
    pub stop: String,
    /// Seconds to wait after restarting this server before touching the next one.
    pub start_delay: Option<u64>,
    /// Servers that must be restarted whenever this one is.
    #[serde(default)]
    pub cascade: Vec<String>,
    /// CPU usage above which a warning is logged.
    pub max_cpu_percent: Option<f64>,
    /// Resident memory above which a warning is logged.
    pub max_mem_bytes: Option<u64>,
}

/// Raw supervisor timing values as written in the config file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SupervisorConfig {
    /// Delay between two checks of the fleet.
    pub tick_interval: Option<String>,
    /// Grace period between stop commands and SIGKILL escalation.
    pub shutdown_settle: Option<String>,
    /// Interval between SIGKILL sweeps.
    pub kill_retry_interval: Option<String>,
    /// Optional bound on SIGKILL sweeps; absent means retry until every pid is gone.
    pub max_kill_attempts: Option<u32>,
}

/// Resolved supervisor timing values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub tick_interval: Duration,
    pub shutdown_settle: Duration,
    pub kill_retry_interval: Duration,
    pub max_kill_attempts: Option<u32>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_settle: DEFAULT_SHUTDOWN_SETTLE,
            kill_retry_interval: DEFAULT_KILL_RETRY_INTERVAL,
            max_kill_attempts: None,
        }
    }
}

impl SupervisorConfig {
    /// Parses the duration strings, falling back to defaults for absent values.
    pub fn resolve(&self) -> Result<SupervisorSettings, FleetError> {
        let defaults = SupervisorSettings::default();
        let pick = |raw: &Option<String>, fallback: Duration| match raw {
            Some(value) => parse_duration(value),
            None => Ok(fallback),
        };

        Ok(SupervisorSettings {
            tick_interval: pick(&self.tick_interval, defaults.tick_interval)?,
            shutdown_settle: pick(&self.shutdown_settle, defaults.shutdown_settle)?,
            kill_retry_interval: pick(
                &self.kill_retry_interval,
                defaults.kill_retry_interval,
            )?,
            max_kill_attempts: self.max_kill_attempts,
        })
    }
}

impl Config {
    /// Rejects cascades into servers that are not defined.
    pub fn validate(&self) -> Result<(), FleetError> {
        for (name, server) in &self.servers {
            for target in &server.cascade {
                if !self.servers.contains_key(target) {
                    return Err(FleetError::UnknownCascadeTarget {
                        server: name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, FleetError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(FleetError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || FleetError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `$VAR` and `${VAR}` references using the process environment.
fn expand_env_vars(input: &str) -> Result<String, FleetError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| FleetError::InvalidConfig(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(FleetError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, FleetError> {
    let config_path = config_path.map(Path::new).unwrap_or_else(|| {
        if Path::new("fleetd.yaml").exists() {
            Path::new("fleetd.yaml")
        } else {
            Path::new("fleet.yaml")
        }
    });

    let content = fs::read_to_string(config_path).map_err(|e| {
        FleetError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let config: Config =
        serde_yaml::from_str(&expanded_content).map_err(FleetError::ConfigParseError)?;

    config.validate()?;
    Ok(config)
}
