//! # Fleet Manager
//!
//! Local control plane for a small fleet of hosts, containers and supervised
//! service processes.
//!
//! ## Features
//!
//! - **Process Supervision**: Start, stop and restart detached infra-api, agent and
//!   mcp-server processes with pid files, captured logs and escalating termination
//! - **Self-Healing Registry**: Registry rows are cross-checked against OS liveness
//!   on every read and by a periodic heartbeat sweep
//! - **Catalog Reconciliation**: Hosts and containers mirrored from the container
//!   runtime, with idempotent host registration and duplicate-host merging
//! - **Single-Writer Actor**: Foreground requests and the heartbeat share one task
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleet_manager::{Parser, ProcessSupervisor, Store, SupervisorOptions};
//!
//! # async fn example() -> Result<(), fleet_manager::Error> {
//! let parser = Parser::new();
//! let config_path = parser.find_config_file()?;
//! let config = parser.load_config(&config_path)?;
//! let base_dir = config_path.parent().unwrap_or(std::path::Path::new("."));
//!
//! let store = Store::open(&config.data_dir_path(base_dir)).await?;
//! let supervisor = ProcessSupervisor::new(
//!     store.registry(),
//!     SupervisorOptions::from_config(&config, base_dir),
//! );
//!
//! if let Some(spec) = config.command_specs(base_dir).remove("agent") {
//!     supervisor.start("agent", spec, serde_json::Value::Null).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod reconciler;
pub mod runtime;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use config::{CommandSpec, Config, Parser};
pub use docker::{DockerClient, DockerError};
pub use error::{Error, Result};
pub use reconciler::{HostIdentity, StateReconciler, SyncOutcome};
pub use runtime::ContainerRuntime;
pub use state::{ManagedService, ServiceStatus, ServiceType, Store};
pub use supervisor::{ProcessSupervisor, SupervisorHandle, SupervisorOptions};
