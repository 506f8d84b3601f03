//! Shared helpers for reconciler tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_manager::docker::DockerError;
use fleet_manager::runtime::{ContainerRuntime, ExecOutput, RuntimeContainer};
use fleet_manager::state::{ContainerStatus, HostResources, Store};
use fleet_manager::{HostIdentity, StateReconciler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory container runtime that can be switched off.
pub struct FakeRuntime {
    containers: Mutex<Vec<RuntimeContainer>>,
    available: AtomicBool,
    resources: HostResources,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            resources: HostResources {
                cpus: 8,
                memory_bytes: 16 * 1024 * 1024 * 1024,
                server_version: Some("fake-1.0".to_string()),
                ..Default::default()
            },
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_containers(&self, containers: Vec<RuntimeContainer>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn ids(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    fn check(&self) -> Result<(), DockerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DockerError::DaemonUnavailable)
        }
    }

    fn set_status(&self, id: &str, status: ContainerStatus) -> Result<(), DockerError> {
        let mut containers = self.containers.lock().unwrap();
        match containers.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.status = status;
                Ok(())
            }
            None => Err(not_found(id)),
        }
    }
}

fn not_found(id: &str) -> DockerError {
    DockerError::ContainerNotFound {
        container: id.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn info(&self) -> Result<HostResources, DockerError> {
        self.check()?;
        let mut resources = self.resources.clone();
        let containers = self.containers.lock().unwrap();
        resources.containers = containers.len() as u32;
        resources.containers_running = containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Running)
            .count() as u32;
        Ok(resources)
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>, DockerError> {
        self.check()?;
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn start(&self, id: &str) -> Result<(), DockerError> {
        self.check()?;
        self.set_status(id, ContainerStatus::Running)
    }

    async fn stop(&self, id: &str) -> Result<(), DockerError> {
        self.check()?;
        self.set_status(id, ContainerStatus::Exited)
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        self.check()?;
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id);
        if containers.len() == before {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, DockerError> {
        self.check()?;
        if !self.ids().iter().any(|c| c == id) {
            return Err(not_found(id));
        }
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: cmd.join(" "),
            stderr: String::new(),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, DockerError> {
        self.check()?;
        if !self.ids().iter().any(|c| c == id) {
            return Err(not_found(id));
        }
        Ok(format!("last {} lines of {}", tail, id))
    }
}

pub fn container(id: &str, status: ContainerStatus) -> RuntimeContainer {
    let mut c = RuntimeContainer::new(id, "nginx:1.25", status);
    c.name = format!("{}-name", id);
    c
}

pub fn identity() -> HostIdentity {
    HostIdentity::new("test-box", "127.0.0.1", vec!["local".to_string()])
}

pub async fn reconciler_with(runtime: Arc<FakeRuntime>) -> (Store, StateReconciler) {
    let store = Store::open_in_memory().await.expect("Failed to open store");
    let reconciler = StateReconciler::new(store.catalog(), runtime, identity());
    (store, reconciler)
}
