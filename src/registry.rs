//! The set of supervised servers, built once from configuration.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    config::{Config, ServerConfig},
    deps::{self, Resolution},
    error::FleetError,
};

/// Counters captured by the previous resource sample of a server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Cumulative user-mode clock ticks, when the platform reports them.
    pub user_ticks: Option<u64>,
    /// Cumulative kernel-mode clock ticks, when the platform reports them.
    pub system_ticks: Option<u64>,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// When the sample was taken.
    pub taken_at: Instant,
}

/// Everything the supervisor knows about one server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub pid_file: PathBuf,
    pub expected_cmdline_prefix: String,
    pub start_command: Option<String>,
    pub restart_command: String,
    pub stop_command: String,
    pub start_delay: Option<Duration>,
    pub cascade_dependents: BTreeSet<String>,
    pub max_cpu_percent: Option<f64>,
    pub max_mem_bytes: Option<u64>,
    /// Servers restarted together with this one, in restart order.
    pub restart_closure: Vec<String>,
    /// Ordering weight; lower restarts first.
    pub priority: u32,
    /// Previous resource sample, cleared whenever the server is restarted.
    pub sample: Option<ResourceSample>,
}

impl ServerSpec {
    fn from_config(name: &str, config: &ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            pid_file: config.pid_file.clone(),
            expected_cmdline_prefix: config.cmdline.clone(),
            start_command: config.start.clone(),
            restart_command: config.restart.clone(),
            stop_command: config.stop.clone(),
            start_delay: config
                .start_delay
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            cascade_dependents: config.cascade.iter().cloned().collect(),
            max_cpu_percent: config.max_cpu_percent,
            max_mem_bytes: config.max_mem_bytes,
            restart_closure: Vec::new(),
            priority: 0,
            sample: None,
        }
    }

    /// Convenience constructor used by tests and embedders that skip the config file.
    pub fn new(name: &str, pid_file: impl Into<PathBuf>, cmdline: &str) -> Self {
        Self {
            name: name.to_string(),
            pid_file: pid_file.into(),
            expected_cmdline_prefix: cmdline.to_string(),
            start_command: None,
            restart_command: format!("restart {name}"),
            stop_command: format!("stop {name}"),
            start_delay: None,
            cascade_dependents: BTreeSet::new(),
            max_cpu_percent: None,
            max_mem_bytes: None,
            restart_closure: Vec::new(),
            priority: 0,
            sample: None,
        }
    }

    /// Adds cascade targets.
    pub fn with_cascade(mut self, targets: &[&str]) -> Self {
        self.cascade_dependents
            .extend(targets.iter().map(|target| target.to_string()));
        self
    }
}

/// All configured servers keyed by name, with derived ordering data filled in.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerSpec>,
    resolution: Resolution,
}

impl ServerRegistry {
    /// Builds the registry from a parsed config.
    pub fn from_config(config: &Config) -> Result<Self, FleetError> {
        let specs = config
            .servers
            .iter()
            .map(|(name, server)| ServerSpec::from_config(name, server))
            .collect();
        Self::from_specs(specs)
    }

    /// Builds the registry from ready-made specs, validating cascade targets and
    /// computing closures and priorities.
    pub fn from_specs(specs: Vec<ServerSpec>) -> Result<Self, FleetError> {
        let mut servers: BTreeMap<String, ServerSpec> = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        for spec in servers.values() {
            for target in &spec.cascade_dependents {
                if !servers.contains_key(target) {
                    return Err(FleetError::UnknownCascadeTarget {
                        server: spec.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        let graph: BTreeMap<String, BTreeSet<String>> = servers
            .iter()
            .map(|(name, spec)| (name.clone(), spec.cascade_dependents.clone()))
            .collect();
        let resolution = deps::resolve(&graph);

        for (name, spec) in servers.iter_mut() {
            spec.priority = resolution.priority(name);
            spec.restart_closure = resolution.ordered_closure(name);
        }

        Ok(Self {
            servers,
            resolution,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServerSpec> {
        self.servers.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Server names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Every server sorted by ascending priority; the fleet start order.
    pub fn start_order(&self) -> Vec<String> {
        self.resolution.start_order()
    }

    /// Cycles found while resolving the cascade graph.
    pub fn cycles(&self) -> &[Vec<String>] {
        self.resolution.cycles()
    }
}
