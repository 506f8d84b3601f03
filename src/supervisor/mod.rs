//! Local process supervision for infra-api, agent and mcp-server services.
//!
//! [`ProcessSupervisor`] owns the lifecycle of detached service processes and
//! keeps the service registry consistent with what the OS reports. Every
//! registry row that claims a process is checked against pid liveness on read,
//! and `stop` / `start` go through the same escalating kill path so a stale
//! row or a leftover process from an earlier run never blocks a new launch.
//!
//! - `os` - spawning, signalling and process-table scans
//! - `files` - pid files, log files and tailing
//! - `heartbeat` - the periodic liveness sweep
//! - `actor` - single-writer task wrapping a supervisor

pub mod actor;
pub mod files;
pub mod heartbeat;
pub mod os;

pub use actor::{SupervisorHandle, SupervisorTask};
pub use files::ServiceFiles;
pub use heartbeat::SweepReport;

use crate::config::{CommandSpec, Config};
use crate::error::{validate_pid_for_check, validate_pid_start_time, Error, Result};
use crate::state::{ManagedService, ServiceRegistry, ServiceType, StartingRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lines of stderr quoted in `last_error` when a launch dies during settle.
const LAUNCH_FAILURE_TAIL: usize = 20;

/// Tunables and launch recipes for a [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory holding pid and log files.
    pub services_dir: PathBuf,
    /// Wait between spawn and the liveness probe.
    pub settle_delay: Duration,
    /// SIGTERM grace window before SIGKILL.
    pub stop_grace: Duration,
    /// Terminal rows older than this are purged by the heartbeat sweep.
    pub stale_record_age: Option<Duration>,
    /// Configured recipes, used by `restart` when no snapshot is stored.
    pub recipes: BTreeMap<String, CommandSpec>,
}

impl SupervisorOptions {
    pub fn new(services_dir: impl Into<PathBuf>) -> Self {
        Self {
            services_dir: services_dir.into(),
            settle_delay: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
            stale_record_age: None,
            recipes: BTreeMap::new(),
        }
    }

    /// Options for the data directory resolved from `config`.
    pub fn from_config(config: &Config, base_dir: &Path) -> Self {
        Self {
            services_dir: config.data_dir_path(base_dir).join("services"),
            settle_delay: config.supervisor.settle_delay(),
            stop_grace: config.supervisor.stop_grace(),
            stale_record_age: config.supervisor.stale_record_age(),
            recipes: config.command_specs(base_dir),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_stale_record_age(mut self, age: Duration) -> Self {
        self.stale_record_age = Some(age);
        self
    }

    pub fn with_recipe(mut self, name: impl Into<String>, spec: CommandSpec) -> Self {
        self.recipes.insert(name.into(), spec);
        self
    }
}

/// What gets persisted as a row's `config_snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSnapshot {
    pub command: CommandSpec,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Recent output of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Starts, stops and watches detached service processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: ServiceRegistry,
    files: ServiceFiles,
    options: SupervisorOptions,
}

impl ProcessSupervisor {
    pub fn new(registry: ServiceRegistry, options: SupervisorOptions) -> Self {
        let files = ServiceFiles::new(options.services_dir.clone());
        Self {
            registry,
            files,
            options,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn files(&self) -> &ServiceFiles {
        &self.files
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Launch `name` from `spec`, replacing whatever was running under it.
    ///
    /// Returns true once the process survived the settle delay and the row is
    /// `running`. Failures are recorded on the row as `error` and reported as
    /// false.
    #[tracing::instrument(skip(self, spec, config), fields(program = %spec.program))]
    pub async fn start(&self, name: &str, spec: CommandSpec, config: serde_json::Value) -> bool {
        let service_type = spec.service_type;
        match self.launch(name, spec, config).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start service '{}': {}", name, e);
                self.record_failure(name, service_type, &e.to_string()).await;
                false
            }
        }
    }

    async fn launch(&self, name: &str, spec: CommandSpec, config: serde_json::Value) -> Result<bool> {
        files::service_file_stem(name)?;

        if let Err(e) = self.force_cleanup(name).await {
            warn!("Cleanup before starting '{}' failed: {}", name, e);
        }

        self.files.ensure_dir()?;
        let stdout_log = self.files.stdout_path(name)?;
        let stderr_log = self.files.stderr_path(name)?;

        info!("Starting service '{}': {}", name, spec.display_line());
        let pid = os::spawn_detached(&spec, &stdout_log, &stderr_log)?;

        let snapshot = serde_json::to_string(&LaunchSnapshot {
            command: spec.clone(),
            config,
        })?;

        let recorded: Result<()> = async {
            self.files.write_pid(name, pid)?;
            self.registry
                .mark_starting(StartingRecord {
                    name: name.to_string(),
                    service_type: spec.service_type,
                    pid,
                    port: spec.port,
                    host: spec.host.clone(),
                    config_snapshot: Some(snapshot),
                })
                .await
        }
        .await;

        if let Err(e) = recorded {
            // Nothing tracks the process now, so it must not outlive this call
            if let Err(kill_err) = os::terminate(pid, self.options.stop_grace, name).await {
                warn!("Failed to terminate untracked PID {} for '{}': {}", pid, name, kill_err);
            }
            let _ = self.files.remove_pid(name);
            return Err(e);
        }

        tokio::time::sleep(self.options.settle_delay).await;

        if os::is_alive(pid) {
            if self.registry.mark_running(name, pid).await? {
                info!("Service '{}' running (PID {})", name, pid);
                return Ok(true);
            }
            // Row was replaced or stopped while we settled
            warn!("Service '{}' changed while starting, PID {} no longer recorded", name, pid);
            return Ok(false);
        }

        self.files.remove_pid(name)?;
        let tail = files::tail(&stderr_log, LAUNCH_FAILURE_TAIL).unwrap_or_default();
        let message = launch_failure_message(&stderr_log, &tail);
        warn!("Service '{}' exited during startup (PID {})", name, pid);
        self.record_failure(name, spec.service_type, &message).await;
        Ok(false)
    }

    async fn record_failure(&self, name: &str, service_type: ServiceType, message: &str) {
        if files::service_file_stem(name).is_err() {
            return;
        }
        if let Err(e) = self.registry.mark_error(name, service_type, message).await {
            error!("Failed to record error for '{}': {}", name, e);
        }
    }

    /// Stop `name`. Idempotent; true once the row reads `stopped`.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> bool {
        match self.terminate_service(name).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to stop service '{}': {}", name, e);
                false
            }
        }
    }

    /// Kill anything left over under `name` and reset its row and pid file.
    pub(crate) async fn force_cleanup(&self, name: &str) -> Result<()> {
        debug!("Cleaning up before start of '{}'", name);
        self.terminate_service(name).await
    }

    async fn terminate_service(&self, name: &str) -> Result<()> {
        files::service_file_stem(name)?;
        let row = self.registry.get(name).await?;
        let pid_file = self.files.read_pid(name);

        let target = match row.as_ref().and_then(|r| r.pid.map(|pid| (pid, r.started_at))) {
            Some(found) => Some(found),
            None => pid_file.map(|record| (record.pid, record.written_at)),
        };

        let mut handled = Vec::new();
        if let Some((pid, expected_start)) = target {
            if self.safe_to_signal(name, pid, expected_start) {
                match os::terminate(pid, self.options.stop_grace, name).await {
                    Ok(os::Termination::NotRunning) => {
                        debug!("Service '{}' (PID {}) was not running", name, pid)
                    }
                    Ok(outcome) => info!("Stopped service '{}' (PID {}): {:?}", name, pid, outcome),
                    Err(e) => warn!("Failed to stop '{}' (PID {}): {}", name, pid, e),
                }
            }
            handled.push(pid);
        }

        for orphan in os::find_orphans(name, &handled) {
            warn!(
                "Terminating orphaned process {} for '{}': {}",
                orphan.pid, name, orphan.cmdline
            );
            if let Err(e) = os::terminate(orphan.pid, self.options.stop_grace, name).await {
                warn!("Failed to terminate orphan {} for '{}': {}", orphan.pid, name, e);
            }
        }

        self.files.remove_pid(name)?;
        if !self.registry.mark_stopped(name).await? {
            debug!("No registry row for '{}', nothing to mark stopped", name);
        }
        Ok(())
    }

    /// Never signal an invalid pid, or one whose process started at a
    /// different time than recorded.
    fn safe_to_signal(&self, name: &str, pid: u32, expected_start: Option<DateTime<Utc>>) -> bool {
        if validate_pid_for_check(pid).is_none() {
            warn!("Refusing to signal invalid PID {} recorded for '{}'", pid, name);
            return false;
        }
        if let Some(started) = expected_start {
            if os::is_alive(pid) && !validate_pid_start_time(pid, started) {
                warn!("PID {} recorded for '{}' now belongs to another process", pid, name);
                return false;
            }
        }
        true
    }

    /// Registry row for `name`, corrected against OS liveness.
    pub async fn status(&self, name: &str) -> Result<Option<ManagedService>> {
        match self.registry.get(name).await? {
            Some(row) => self.heal(row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Every registry row, each corrected like [`status`](Self::status).
    pub async fn list_services(&self) -> Result<Vec<ManagedService>> {
        let mut services = Vec::new();
        for row in self.registry.list().await? {
            services.push(self.heal(row).await?);
        }
        Ok(services)
    }

    async fn heal(&self, row: ManagedService) -> Result<ManagedService> {
        if !row.status.expects_process() {
            return Ok(row);
        }
        if let Some(pid) = row.pid {
            if self.pid_matches_row(pid, &row) {
                return Ok(row);
            }
            if self.registry.mark_dead_if_pid(&row.name, pid).await? {
                info!("Service '{}' (PID {}) is gone, marked stopped", row.name, pid);
                if let Err(e) = self.files.remove_pid(&row.name) {
                    warn!("Failed to remove pid file for '{}': {}", row.name, e);
                }
            }
        }
        Ok(self.registry.get(&row.name).await?.unwrap_or(row))
    }

    /// Stop `name` and start it again from its stored snapshot, or from the
    /// configured recipe when the snapshot is missing or unreadable.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> Result<bool> {
        let (spec, config) = self.resolve_launch(name).await?;
        if !self.stop(name).await {
            warn!("Stop before restart of '{}' failed, starting anyway", name);
        }
        Ok(self.start(name, spec, config).await)
    }

    async fn resolve_launch(&self, name: &str) -> Result<(CommandSpec, serde_json::Value)> {
        let snapshot = self
            .registry
            .get(name)
            .await?
            .and_then(|row| row.config_snapshot);

        if let Some(raw) = snapshot.as_deref() {
            match serde_json::from_str::<LaunchSnapshot>(raw) {
                Ok(s) => return Ok((s.command, s.config)),
                Err(e) => warn!("Unreadable launch snapshot for '{}': {}", name, e),
            }
        }

        match self.options.recipes.get(name) {
            Some(spec) => Ok((spec.clone(), serde_json::Value::Null)),
            None => Err(Error::NoLaunchRecipe {
                name: name.to_string(),
                reason: if snapshot.is_some() {
                    "stored snapshot is unreadable".to_string()
                } else {
                    "no stored snapshot".to_string()
                },
            }),
        }
    }

    /// Last `lines` lines of the service's stdout and stderr logs.
    pub fn log_tail(&self, name: &str, lines: usize) -> Result<LogTail> {
        Ok(LogTail {
            stdout: files::tail(&self.files.stdout_path(name)?, lines)?,
            stderr: files::tail(&self.files.stderr_path(name)?, lines)?,
        })
    }
}

fn launch_failure_message(stderr_log: &Path, tail: &[String]) -> String {
    if tail.is_empty() {
        format!(
            "process exited during startup (no stderr output, see {})",
            stderr_log.display()
        )
    } else {
        format!(
            "process exited during startup (see {}): {}",
            stderr_log.display(),
            tail.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_references_log() {
        let path = Path::new("/tmp/data/services/api.err.log");
        let empty = launch_failure_message(path, &[]);
        assert!(empty.contains("api.err.log"));
        assert!(empty.contains("no stderr output"));

        let msg = launch_failure_message(path, &["boom".to_string()]);
        assert!(msg.contains("api.err.log"));
        assert!(msg.ends_with("boom"));
    }

    #[test]
    fn snapshot_tolerates_missing_config() {
        let raw = r#"{"command":{"service_type":"agent","program":"agentd"}}"#;
        let snap: LaunchSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.command.program, "agentd");
        assert!(snap.config.is_null());
    }

    #[test]
    fn options_builders() {
        let opts = SupervisorOptions::new("/tmp/x")
            .with_settle_delay(Duration::from_millis(10))
            .with_stop_grace(Duration::from_millis(20))
            .with_stale_record_age(Duration::from_secs(60))
            .with_recipe("api", CommandSpec::new(ServiceType::InfraApi, "api"));
        assert_eq!(opts.settle_delay, Duration::from_millis(10));
        assert_eq!(opts.stop_grace, Duration::from_millis(20));
        assert_eq!(opts.stale_record_age, Some(Duration::from_secs(60)));
        assert!(opts.recipes.contains_key("api"));
    }
}
