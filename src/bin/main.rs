use std::{
    error::Error,
    path::{Path, PathBuf},
};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetd::{
    cli::{Cli, Commands, CtlAction, parse_args},
    config::{Config, load_config},
    control::{self, ControlClient},
    error::FleetError,
    ipc,
    registry::ServerRegistry,
    supervisor::{StatusSnapshot, Supervisor, SupervisorHandle},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { config, no_start } => run(&config, no_start)?,
        Commands::Check { config } => check(&config)?,
        Commands::Order { config, server } => order(&config, server.as_deref())?,
        Commands::Ctl { socket, action } => {
            let socket = match socket {
                Some(path) => path,
                None => ipc::default_socket_path()?,
            };
            ctl(&socket, action)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn control_socket(config: &Config) -> Result<PathBuf, Box<dyn Error>> {
    match &config.control_socket {
        Some(path) => Ok(path.clone()),
        None => Ok(ipc::default_socket_path()?),
    }
}

fn run(config_path: &str, no_start: bool) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let mut supervisor = Supervisor::from_config(&config)?;
    let handle = supervisor.handle();
    register_signal_handler(handle.clone())?;

    let socket = control_socket(&config)?;
    let mut server = control::serve(&socket, handle)?;

    if no_start {
        info!("Skipping fleet start; supervising running servers");
    } else {
        supervisor.start();
    }
    supervisor.check_and_restart();

    let report = supervisor.shutdown_all();
    if !report.survivors.is_empty() {
        warn!("Servers still alive after shutdown: {:?}", report.survivors);
    }
    server.shutdown();
    info!("fleetd exiting");
    Ok(())
}

fn check(config_path: &str) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    config.supervisor.resolve()?;
    let registry = ServerRegistry::from_config(&config)?;

    println!("Configuration OK: {} servers", registry.len());
    for cycle in registry.cycles() {
        println!("warning: cascade cycle {}", cycle.join(" -> "));
    }
    Ok(())
}

fn order(config_path: &str, server: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let registry = ServerRegistry::from_config(&config)?;

    let names = match server {
        Some(name) => registry
            .get(name)
            .map(|spec| spec.restart_closure.clone())
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))?,
        None => registry.start_order(),
    };
    for (position, name) in names.iter().enumerate() {
        let priority = registry.get(name).map(|spec| spec.priority).unwrap_or_default();
        println!("{}. {name} (priority {priority})", position + 1);
    }
    Ok(())
}

fn ctl(socket: &Path, action: CtlAction) -> Result<(), Box<dyn Error>> {
    let client = ControlClient::connect(socket)?;
    match action {
        CtlAction::Ping => {
            client.ping()?;
            println!("pong");
        }
        CtlAction::Status { json } => {
            let status = client.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        CtlAction::Restart { name } => {
            client.restart(&name)?;
            println!("Restart of '{name}' queued");
        }
        CtlAction::Shutdown => {
            client.shutdown()?;
            println!("Shutdown requested");
        }
    }
    Ok(())
}

fn print_status(status: &StatusSnapshot) {
    println!(
        "{:<20} {:>8} {:>8} {:>9} {:>9} {:>7} {:>12}",
        "NAME", "PID", "RUNNING", "EXCEPTED", "RESTARTS", "CPU%", "RSS"
    );
    for server in &status.servers {
        let pid = server.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let cpu = server
            .cpu_percent
            .map_or_else(|| "-".to_string(), |cpu| format!("{cpu:.1}"));
        let rss = server
            .rss_bytes
            .map_or_else(|| "-".to_string(), |rss| rss.to_string());
        println!(
            "{:<20} {:>8} {:>8} {:>9} {:>9} {:>7} {:>12}",
            server.name,
            pid,
            if server.running { "yes" } else { "no" },
            if server.excepted { "yes" } else { "no" },
            server.restarts,
            cpu,
            rss
        );
    }
    if !status.checking {
        println!("(supervisor is no longer checking)");
    }
}

fn register_signal_handler(handle: SupervisorHandle) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        println!("fleetd is shutting down... stopping every server");
        handle.stop();
    })?;

    Ok(())
}
