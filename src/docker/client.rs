//! Centralized Docker CLI client.
//!
//! All Docker CLI interactions go through `DockerClient`, which provides
//! consistent timeout handling, error mapping to [`DockerError`], and a single
//! point where `Command::new("docker")` is constructed.

use super::DockerError;
use crate::runtime::{ExecOutput, RuntimeContainer};
use crate::state::{ContainerStatus, HostResources, PortBinding};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::process::Output;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Centralized client for Docker CLI operations.
///
/// Wraps all `docker` subprocess invocations with a per-command timeout and
/// structured [`DockerError`] returns. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DockerClient {
    binary: String,
    timeout: Duration,
}

impl DockerClient {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different CLI binary (e.g. `podman`, which accepts the same verbs).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn command_string(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run a docker command with the client timeout, returning raw Output.
    async fn run(&self, args: &[&str]) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(self.command_string(args), e)),
            Err(_) => Err(DockerError::timeout(self.command_string(args), self.timeout)),
        }
    }

    /// Run a docker command, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str]) -> Result<Output, DockerError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(DockerError::failed(self.command_string(args), &output))
        }
    }

    /// Run a command against one container, mapping "No such container".
    async fn run_on(&self, container: &str, args: &[&str]) -> Result<Output, DockerError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(DockerError::failed_for(
                self.command_string(args),
                container,
                &output,
            ))
        }
    }

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    pub async fn start(&self, container: &str) -> Result<(), DockerError> {
        self.run_on(container, &["start", container]).await.map(|_| ())
    }

    /// Stop a container gracefully.
    pub async fn stop(&self, container: &str) -> Result<(), DockerError> {
        self.run_on(container, &["stop", container]).await.map(|_| ())
    }

    /// Force-remove a container.
    pub async fn rm_force(&self, container: &str) -> Result<(), DockerError> {
        self.run_on(container, &["rm", "-f", container]).await.map(|_| ())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Ids of every container, running or not.
    pub async fn ps_ids(&self) -> Result<Vec<String>, DockerError> {
        let output = self.run_success(&["ps", "-aq", "--no-trunc"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Inspect the given containers.
    ///
    /// A container removed between `ps` and `inspect` makes docker exit
    /// non-zero while still printing the others, so stdout is parsed whenever
    /// it holds a JSON array.
    pub async fn inspect(&self, ids: &[String]) -> Result<Vec<RuntimeContainer>, DockerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<&str> = vec!["inspect", "--type", "container"];
        args.extend(ids.iter().map(String::as_str));

        let output = self.run(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_inspect(&stdout) {
            Ok(containers) => {
                if !output.status.success() {
                    tracing::debug!(
                        "docker inspect exited {:?}; {} of {} container(s) still listed",
                        output.status.code(),
                        containers.len(),
                        ids.len()
                    );
                }
                Ok(containers)
            }
            Err(_) if !output.status.success() => {
                Err(DockerError::failed(self.command_string(&args), &output))
            }
            Err(reason) => Err(DockerError::invalid_output(
                self.command_string(&["inspect"]),
                reason,
            )),
        }
    }

    /// `docker info` as a resource snapshot.
    pub async fn info(&self) -> Result<HostResources, DockerError> {
        let args = ["info", "--format", "{{json .}}"];
        let output = self.run_success(&args).await?;
        parse_info(&String::from_utf8_lossy(&output.stdout))
            .map_err(|reason| DockerError::invalid_output(self.command_string(&args), reason))
    }

    /// Check if the Docker daemon is healthy.
    pub async fn daemon_healthy(&self) -> bool {
        matches!(
            self.run(&["info", "--format", "{{.ServerVersion}}"]).await,
            Ok(o) if o.status.success()
        )
    }

    // ========================================================================
    // Exec / Logs
    // ========================================================================

    /// Run a command inside a running container. A non-zero exit from the
    /// command itself is reported in [`ExecOutput`], not as an error.
    pub async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, DockerError> {
        let mut args = vec!["exec", container];
        args.extend(cmd.iter().map(String::as_str));
        let output = self.run(&args).await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            // Missing container, stopped container or unreachable daemon are
            // runtime errors, not command results
            let err = DockerError::failed_for(self.command_string(&args), container, &output);
            if err.is_not_found() || err.is_unavailable() || stderr.contains("is not running") {
                return Err(err);
            }
        }

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    /// Fetch the last `tail` log lines. Docker replays the container's stderr
    /// on its own stderr, so both streams are concatenated.
    pub async fn logs(&self, container: &str, tail: usize) -> Result<String, DockerError> {
        let tail_str = tail.to_string();
        let output = self
            .run_on(container, &["logs", "--tail", &tail_str, container])
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// JSON shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
    #[serde(default)]
    mounts: Option<Vec<InspectMount>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    host_ip: Option<String>,
    #[serde(default)]
    host_port: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoEntry {
    #[serde(rename = "NCPU", default)]
    ncpu: u32,
    #[serde(rename = "MemTotal", default)]
    mem_total: u64,
    #[serde(rename = "Containers", default)]
    containers: u32,
    #[serde(rename = "ContainersRunning", default)]
    containers_running: u32,
    #[serde(rename = "Images", default)]
    images: u32,
    #[serde(rename = "ServerVersion", default)]
    server_version: Option<String>,
    #[serde(rename = "OperatingSystem", default)]
    operating_system: Option<String>,
}

/// Docker reports unset timestamps as the zero time `0001-01-01T00:00:00Z`.
fn docker_time(s: Option<&str>) -> Option<DateTime<Utc>> {
    let s = s?.trim();
    if s.is_empty() || s.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_ports(
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
) -> Vec<PortBinding> {
    let mut out = Vec::new();
    for (key, bindings) in ports.unwrap_or_default() {
        // "80/tcp"
        let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        match bindings {
            Some(bindings) if !bindings.is_empty() => {
                for b in bindings {
                    out.push(PortBinding {
                        container_port,
                        protocol: protocol.to_string(),
                        host_ip: b.host_ip.filter(|ip| !ip.is_empty()),
                        host_port: b.host_port.and_then(|p| p.parse().ok()),
                    });
                }
            }
            _ => out.push(PortBinding {
                container_port,
                protocol: protocol.to_string(),
                host_ip: None,
                host_port: None,
            }),
        }
    }
    out.sort_by(|a, b| {
        (a.container_port, &a.protocol, &a.host_ip, a.host_port).cmp(&(
            b.container_port,
            &b.protocol,
            &b.host_ip,
            b.host_port,
        ))
    });
    out
}

fn parse_env(env: Option<Vec<String>>) -> BTreeMap<String, String> {
    env.unwrap_or_default()
        .into_iter()
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv, String::new()),
        })
        .collect()
}

pub(crate) fn parse_inspect(json: &str) -> Result<Vec<RuntimeContainer>, String> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(json.trim()).map_err(|e| e.to_string())?;

    Ok(entries
        .into_iter()
        .map(|e| {
            let status = ContainerStatus::parse(&e.state.status);
            let stopped = matches!(status, ContainerStatus::Exited | ContainerStatus::Dead);
            let volumes = e
                .mounts
                .unwrap_or_default()
                .into_iter()
                .map(|m| {
                    let source = if m.source.is_empty() {
                        m.name.unwrap_or_default()
                    } else {
                        m.source
                    };
                    format!("{}:{}", source, m.destination)
                })
                .collect();

            RuntimeContainer {
                name: e.name.trim_start_matches('/').to_string(),
                image: e.config.image,
                status,
                labels: e.config.labels.unwrap_or_default(),
                ports: parse_ports(e.network_settings.ports),
                environment: parse_env(e.config.env),
                volumes,
                created_at: docker_time(e.created.as_deref()),
                started_at: docker_time(e.state.started_at.as_deref()),
                finished_at: if stopped {
                    docker_time(e.state.finished_at.as_deref())
                } else {
                    None
                },
                exit_code: if stopped { e.state.exit_code } else { None },
                id: e.id,
            }
        })
        .collect())
}

pub(crate) fn parse_info(json: &str) -> Result<HostResources, String> {
    let info: InfoEntry = serde_json::from_str(json.trim()).map_err(|e| e.to_string())?;
    Ok(HostResources {
        cpus: info.ncpu,
        memory_bytes: info.mem_total,
        containers: info.containers,
        containers_running: info.containers_running,
        images: info.images,
        server_version: info.server_version.filter(|s| !s.is_empty()),
        operating_system: info.operating_system.filter(|s| !s.is_empty()),
    })
}
