//! Container runtime capability consumed by the reconciler.
//!
//! [`DockerClient`](crate::docker::DockerClient) implements it over the docker
//! CLI; tests substitute an in-memory runtime.

use crate::docker::DockerError;
use crate::state::{ContainerStatus, HostResources, PortBinding};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One container as reported by the runtime listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

impl RuntimeContainer {
    /// Minimal container, mainly for tests and fakes.
    pub fn new(id: impl Into<String>, image: impl Into<String>, status: ContainerStatus) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            image: image.into(),
            status,
            labels: BTreeMap::new(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            created_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host resource snapshot. Fails with an unavailable error when the daemon
    /// cannot be reached.
    async fn info(&self) -> Result<HostResources, DockerError>;

    /// Every container the runtime knows about, running or not.
    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, DockerError>;

    async fn start(&self, id: &str) -> Result<(), DockerError>;

    async fn stop(&self, id: &str) -> Result<(), DockerError>;

    async fn remove(&self, id: &str) -> Result<(), DockerError>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, DockerError>;

    async fn logs(&self, id: &str, tail: usize) -> Result<String, DockerError>;
}
