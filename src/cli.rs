use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet Manager - Supervise local services and track hosts and containers")]
pub struct Cli {
    /// Config file path (defaults to fleet.yaml, searched upwards)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a configured service
    Start {
        /// Service name
        name: String,
    },
    /// Stop a service
    Stop {
        /// Service name
        name: String,
    },
    /// Restart a service from its last launch, or its configured recipe
    Restart {
        /// Service name
        name: String,
    },
    /// Show service status
    Status {
        /// Single service (defaults to all)
        name: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the tail of a service's stdout and stderr logs
    Logs {
        /// Service name
        name: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Run the supervisor heartbeat and container sync until Ctrl-C
    Daemon,
    /// Check the config file
    Validate,
    /// Manage hosts
    #[command(subcommand)]
    Host(HostCommands),
    /// Manage containers
    #[command(subcommand)]
    Container(ContainerCommands),
    /// Show fleet-wide counters
    System {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum HostCommands {
    /// List hosts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a host, or update the one already known by this IP
    Add {
        name: String,
        ip: String,

        /// Tags (can be repeated)
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Register (or refresh) this machine
    Register,
    /// Merge hosts that share an IP
    Dedupe,
    /// Remove a host and its containers
    Rm { id: String },
}

#[derive(Subcommand)]
pub enum ContainerCommands {
    /// List containers
    List {
        /// Only containers on this host id
        #[arg(long)]
        host: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile the catalog with the container runtime
    Sync,
    /// Start a container
    Start { id: String },
    /// Stop a container
    Stop { id: String },
    /// Remove a container
    Rm { id: String },
    /// Run a command inside a container
    Exec {
        id: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Show container logs
    Logs {
        id: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,
    },
}

impl Commands {
    /// Whether the command writes fleet state and so should hold the data
    /// directory's lock.
    pub fn mutates_state(&self) -> bool {
        match self {
            Commands::Status { .. }
            | Commands::Logs { .. }
            | Commands::System { .. }
            | Commands::Validate
            | Commands::Host(HostCommands::List { .. })
            | Commands::Container(ContainerCommands::List { .. })
            | Commands::Container(ContainerCommands::Logs { .. }) => false,
            _ => true,
        }
    }
}
