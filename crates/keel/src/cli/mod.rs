//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use keel_common::{KeelError, KeelResult};
use keel_network::{BRIDGE_DRIVER, NetworkManager};
use tabled::{Table, Tabled};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cgroup::ResourceLimits;
use crate::runtime::{ContainerManager, ContainerRecord, RunOptions, RuntimeConfig};

/// Keel - Minimal Container Runtime
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for keel state
    #[arg(
        long,
        global = true,
        env = "KEEL_ROOT",
        default_value = "/var/run/keel"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create and run a container
    Run {
        /// Attach the terminal to the container
        #[arg(short = 'i', long, visible_alias = "ti")]
        interactive: bool,

        /// Run the container in the background
        #[arg(short, long)]
        detach: bool,

        /// Memory limit, e.g. 100m
        #[arg(short, long)]
        memory: Option<String>,

        /// Relative CPU weight
        #[arg(long)]
        cpushare: Option<String>,

        /// CPUs the container may run on, e.g. 0-1
        #[arg(long)]
        cpuset: Option<String>,

        /// Bind a host directory, hostPath:containerPath
        #[arg(short, long)]
        volume: Option<String>,

        /// Container name
        #[arg(long)]
        name: Option<String>,

        /// Image to run
        #[arg(long)]
        image: Option<String>,

        /// Network to connect to
        #[arg(long)]
        net: Option<String>,

        /// Publish a port, hostPort:containerPort
        #[arg(short, long)]
        publish: Vec<String>,

        /// Command and arguments
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Container init (internal use only)
    #[command(hide = true)]
    Init,

    /// Run a command in a running container
    Exec {
        /// Container name
        name: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a running container
    Stop {
        /// Container name
        name: String,
    },

    /// Remove a stopped container
    Rm {
        /// Container name
        name: String,
    },

    /// List containers
    Ps,

    /// Print a container's log
    Logs {
        /// Container name
        name: String,
    },

    /// Save a container's filesystem as an image archive
    Commit {
        /// Container name
        name: String,

        /// Image name (default: the container name)
        image: Option<String>,
    },

    /// Manage networks
    Network {
        /// The network subcommand.
        #[command(subcommand)]
        command: NetworkCommands,
    },
}

/// Network commands.
#[derive(Subcommand)]
pub enum NetworkCommands {
    /// Create a network
    Create {
        /// Subnet in CIDR notation
        #[arg(long)]
        subnet: String,

        /// Network driver
        #[arg(long, default_value = BRIDGE_DRIVER)]
        driver: String,

        /// Network name
        name: String,
    },

    /// List networks
    List,

    /// Remove a network
    Remove {
        /// Network name
        name: String,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<ContainerRecord> for ContainerRow {
    fn from(record: ContainerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            pid: record.pid,
            status: record.status.to_string(),
            command: record.command,
            created: record.created_time,
        }
    }
}

#[derive(Tabled)]
struct NetworkRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "IP RANGE")]
    ip_range: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
}

/// Whether an error is a usage mistake that should fail the process.
const fn is_usage_error(err: &KeelError) -> bool {
    matches!(
        err,
        KeelError::InvalidArgument { .. } | KeelError::InvalidContainerId { .. }
    )
}

/// Usage errors fail the command; anything else is logged and swallowed.
fn settle<T>(command: &str, result: KeelResult<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_usage_error(&e) => Err(e.into()),
        Err(e) => {
            tracing::error!(command, error = %e, "Command failed");
            Ok(None)
        }
    }
}

/// Install the global tracing subscriber.
pub fn init_tracing(debug: bool, format: LogFormat) -> Result<()> {
    let directive = if debug { "keel=debug" } else { "keel=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = RuntimeConfig::default().with_root(self.root.clone());
        let manager = ContainerManager::new(config.clone());

        match self.command {
            Commands::Run {
                interactive,
                detach,
                memory,
                cpushare,
                cpuset,
                volume,
                name,
                image,
                net,
                publish,
                command,
            } => {
                let options = RunOptions {
                    command,
                    interactive,
                    detach,
                    limits: ResourceLimits::new(memory, cpushare, cpuset),
                    volume,
                    name,
                    image,
                    network: net,
                    publish,
                };
                if let Some(launched) = settle("run", manager.run(options).await)? {
                    if launched.exit_code.is_none() {
                        println!("{}", launched.name);
                    }
                }
                Ok(())
            }

            Commands::Init => Err(color_eyre::eyre::eyre!(
                "init must be started by the runtime, not from the async entry point"
            )),

            Commands::Exec { name, command } => {
                if let Some(code) = settle("exec", manager.exec(&name, &command).await)? {
                    tracing::debug!(container = %name, exit_code = code, "Exec finished");
                }
                Ok(())
            }

            Commands::Stop { name } => {
                settle("stop", manager.stop(&name))?;
                Ok(())
            }

            Commands::Rm { name } => {
                settle("rm", manager.remove(&name).await)?;
                Ok(())
            }

            Commands::Ps => {
                if let Some(records) = settle("ps", manager.list())? {
                    let rows: Vec<ContainerRow> = records.into_iter().map(Into::into).collect();
                    println!("{}", Table::new(rows));
                }
                Ok(())
            }

            Commands::Logs { name } => {
                if let Some(log) = settle("logs", manager.logs(&name))? {
                    print!("{log}");
                }
                Ok(())
            }

            Commands::Commit { name, image } => {
                if let Some(archive) = settle("commit", manager.commit(&name, image.as_deref()))? {
                    println!("{}", archive.display());
                }
                Ok(())
            }

            Commands::Network { command } => execute_network(&config, command).await,
        }
    }
}

async fn execute_network(config: &RuntimeConfig, command: NetworkCommands) -> Result<()> {
    let Some(mut networks) = settle("network", NetworkManager::load(&config.paths))? else {
        return Ok(());
    };

    match command {
        NetworkCommands::Create {
            subnet,
            driver,
            name,
        } => {
            settle(
                "network create",
                networks.create_network(&driver, &subnet, &name).await,
            )?;
        }

        NetworkCommands::List => {
            let rows: Vec<NetworkRow> = networks
                .networks()
                .map(|network| NetworkRow {
                    name: network.name.clone(),
                    ip_range: network.ip_range.to_string(),
                    driver: network.driver.clone(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }

        NetworkCommands::Remove { name } => {
            settle("network remove", networks.delete_network(&name).await)?;
        }
    }
    Ok(())
}
