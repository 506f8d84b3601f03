mod catalog;
mod services;

pub use catalog::{run_container, run_host, run_system};
pub use services::{run_daemon, run_logs, run_restart, run_start, run_status, run_stop};

use crate::output::UserOutput;
use fleet_manager::{
    Config, DockerClient, HostIdentity, Parser, ProcessSupervisor, StateReconciler, Store,
    SupervisorOptions,
};
use fleet_manager::state::LockMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs: the parsed config and an open store.
pub struct Context {
    pub config: Config,
    pub base_dir: PathBuf,
    pub store: Store,
}

impl Context {
    /// Read-only commands open the store without the lock, so they stay quiet
    /// while a daemon holds it.
    pub async fn load(config_path: Option<PathBuf>, mutates: bool) -> anyhow::Result<Self> {
        let (config, base_dir) = load_config(config_path)?;
        let mode = if mutates {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let store = Store::open_with(&config.data_dir_path(&base_dir), mode).await?;
        Ok(Self {
            config,
            base_dir,
            store,
        })
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(
            self.store.registry(),
            SupervisorOptions::from_config(&self.config, &self.base_dir),
        )
    }

    pub fn reconciler(&self) -> StateReconciler {
        let runtime = DockerClient::new().with_timeout(self.config.runtime.command_timeout());
        StateReconciler::new(
            self.store.catalog(),
            Arc::new(runtime),
            HostIdentity::local(&self.config.host),
        )
    }
}

/// Parse and validate the config, returning it with the directory it lives in.
fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    let parser = Parser::new();
    let config_path = match config_path {
        Some(path) => path,
        None => parser.find_config_file()?,
    };
    let config = parser.load_config(&config_path)?;
    config.validate()?;
    Ok((config, resolve_base_dir(&config_path)?))
}

/// Directory that relative paths in the config are anchored at.
fn resolve_base_dir(config_path: &Path) -> anyhow::Result<PathBuf> {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}

pub fn run_validate(config_path: Option<PathBuf>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(config_path)?;
    out.success(&format!(
        "Config OK: {} service recipe(s), data in {}",
        config.services.len(),
        config.data_dir_path(&base_dir).display()
    ));
    Ok(())
}
