//! Docker CLI backend for the [`ContainerRuntime`] capability.

pub mod client;
pub mod error;

pub use client::DockerClient;
pub use error::DockerError;

use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeContainer};
use crate::state::HostResources;
use async_trait::async_trait;

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn info(&self) -> Result<HostResources, DockerError> {
        DockerClient::info(self).await
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, DockerError> {
        let ids = self.ps_ids().await?;
        self.inspect(&ids).await
    }

    async fn start(&self, id: &str) -> Result<(), DockerError> {
        DockerClient::start(self, id).await
    }

    async fn stop(&self, id: &str) -> Result<(), DockerError> {
        DockerClient::stop(self, id).await
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        self.rm_force(id).await
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, DockerError> {
        DockerClient::exec(self, id, cmd).await
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, DockerError> {
        DockerClient::logs(self, id, tail).await
    }
}
