//! Keeps the host and container catalog in line with the container runtime.
//!
//! The runtime listing is the source of truth: every sync pass inserts what
//! is new, updates statuses that changed and deletes what the runtime no
//! longer reports, then recomputes the fleet-wide counters. An unreachable
//! runtime turns every runtime-backed operation into a reported no-op rather
//! than an error.

pub mod dedupe;
pub mod identity;

pub use dedupe::{plan_merges, survivor_order, MergePlan};
pub use identity::{normalize_ip, HostIdentity, LOOPBACK};

use crate::docker::DockerError;
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeContainer};
use crate::state::{
    Catalog, ContainerChanges, ContainerStatus, Host, HostRefresh, HostStatus, ManagedContainer,
    SystemStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one successful sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub host_id: String,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub system: SystemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(SyncReport),
    /// The runtime could not be reached; the catalog was left untouched.
    RuntimeUnavailable,
}

/// Result of a duplicate-host sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    /// Identity keys that had more than one row.
    pub groups: usize,
    /// Rows folded into a survivor and deleted.
    pub removed: usize,
}

/// Diff the persisted containers of `host_id` against the runtime listing.
///
/// Ids only in the listing are inserted, ids in both whose status differs get
/// a status update, and persisted ids missing from the listing are deleted.
/// A listing that repeats an id keeps the last entry.
pub fn diff_containers(
    host_id: &str,
    persisted: &[ManagedContainer],
    live: &[RuntimeContainer],
    now: DateTime<Utc>,
) -> ContainerChanges {
    let live: BTreeMap<&str, &RuntimeContainer> =
        live.iter().map(|c| (c.id.as_str(), c)).collect();
    let known: BTreeMap<&str, ContainerStatus> = persisted
        .iter()
        .map(|c| (c.id.as_str(), c.status))
        .collect();

    let mut changes = ContainerChanges {
        host_id: host_id.to_string(),
        ..Default::default()
    };

    for (id, container) in &live {
        match known.get(id) {
            None => changes
                .inserts
                .push(to_managed(host_id, container, now)),
            Some(status) if *status != container.status => changes
                .status_updates
                .push((id.to_string(), container.status)),
            Some(_) => {}
        }
    }

    changes.deletes = known
        .keys()
        .filter(|id| !live.contains_key(*id))
        .map(|id| id.to_string())
        .collect();

    changes
}

fn to_managed(host_id: &str, c: &RuntimeContainer, now: DateTime<Utc>) -> ManagedContainer {
    ManagedContainer {
        id: c.id.clone(),
        name: c.name.clone(),
        image: c.image.clone(),
        host_id: host_id.to_string(),
        status: c.status,
        ports: c.ports.clone(),
        volumes: c.volumes.clone(),
        environment: c.environment.clone(),
        labels: c.labels.clone(),
        created_at: c.created_at.unwrap_or(now),
        updated_at: now,
        started_at: c.started_at,
        stopped_at: c.finished_at,
        exit_code: c.exit_code,
    }
}

/// Maintains the host and container catalog against one container runtime.
#[derive(Clone)]
pub struct StateReconciler {
    catalog: Catalog,
    runtime: Arc<dyn ContainerRuntime>,
    identity: HostIdentity,
}

impl StateReconciler {
    pub fn new(catalog: Catalog, runtime: Arc<dyn ContainerRuntime>, identity: HostIdentity) -> Self {
        Self {
            catalog,
            runtime,
            identity,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    /// Adopt or create the catalog row for this machine and mark it online.
    ///
    /// Running it repeatedly never creates a second row. The resource
    /// snapshot is refreshed when the runtime answers and kept otherwise.
    #[tracing::instrument(skip(self), fields(ip = %self.identity.ip))]
    pub async fn register_local_host(&self) -> Result<Host> {
        let now = Utc::now();
        let existing = self.preferred_host_for(&self.identity.ip).await?;

        let id = match existing {
            Some(host) => {
                let tags = identity::merge_tags(&host.tags, &self.identity.tags);
                self.catalog
                    .refresh_host(
                        &host.id,
                        HostRefresh {
                            name: self.identity.name.clone(),
                            status: HostStatus::Online,
                            last_seen: now,
                            tags,
                        },
                    )
                    .await?;
                debug!("Adopted existing host row {}", host.id);
                host.id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.catalog
                    .insert_host(Host {
                        id: id.clone(),
                        name: self.identity.name.clone(),
                        ip: self.identity.ip.clone(),
                        status: HostStatus::Online,
                        last_seen: Some(now),
                        tags: self.identity.tags.clone(),
                        resources: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                info!("Registered local host '{}' as {}", self.identity.name, id);
                id
            }
        };

        match self.runtime.info().await {
            Ok(resources) => {
                self.catalog.update_host_resources(&id, resources).await?;
            }
            Err(e) if e.is_unavailable() => {
                debug!("Container runtime unavailable, keeping previous resources: {}", e)
            }
            Err(e) => warn!("Failed to read host resources: {}", e),
        }

        self.catalog
            .get_host(&id)
            .await?
            .ok_or(Error::HostNotFound(id))
    }

    /// Best existing row for `ip`, without merging duplicates.
    async fn preferred_host_for(&self, ip: &str) -> Result<Option<Host>> {
        let mut hosts = self.catalog.hosts_by_ip(ip).await?;
        hosts.sort_by(survivor_order);
        Ok(hosts.into_iter().next())
    }

    async fn local_host_id(&self) -> Result<String> {
        match self.preferred_host_for(&self.identity.ip).await? {
            Some(host) => Ok(host.id),
            None => Ok(self.register_local_host().await?.id),
        }
    }

    /// Converge the local host's container rows on the runtime listing.
    #[tracing::instrument(skip(self))]
    pub async fn sync_containers(&self) -> Result<SyncOutcome> {
        let live = match self.runtime.list_containers().await {
            Ok(live) => live,
            Err(e) if e.is_unavailable() => {
                debug!("Container runtime unavailable, skipping sync: {}", e);
                return Ok(SyncOutcome::RuntimeUnavailable);
            }
            Err(e) => return Err(e.into()),
        };

        let host_id = self.local_host_id().await?;
        let persisted = self.catalog.list_containers(Some(&host_id)).await?;
        let changes = diff_containers(&host_id, &persisted, &live, Utc::now());

        let (inserted, updated, deleted) = (
            changes.inserts.len(),
            changes.status_updates.len(),
            changes.deletes.len(),
        );
        if !changes.is_empty() {
            self.catalog.apply_container_changes(changes).await?;
            info!(
                "Container sync: {} new, {} updated, {} removed",
                inserted, updated, deleted
            );
        }

        let system = self.catalog.recompute_system_status().await?;
        Ok(SyncOutcome::Synced(SyncReport {
            host_id,
            inserted,
            updated,
            deleted,
            system,
        }))
    }

    /// Fold hosts that share an identity key into a single survivor each.
    #[tracing::instrument(skip(self))]
    pub async fn dedupe_hosts(&self) -> Result<DedupeReport> {
        let hosts = self.catalog.list_hosts().await?;
        let plans = plan_merges(&hosts);

        let mut report = DedupeReport {
            groups: plans.len(),
            removed: 0,
        };
        for plan in plans {
            let removed = self
                .catalog
                .merge_hosts(&plan.survivor, plan.duplicates)
                .await?;
            info!(
                "Merged {} duplicate host(s) for {} into {}",
                removed, plan.ip, plan.survivor
            );
            report.removed += removed;
        }

        if report.removed > 0 {
            self.catalog.recompute_system_status().await?;
        }
        Ok(report)
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.catalog.list_hosts().await
    }

    /// Adopt the row already keyed on `ip` or create a new one.
    ///
    /// An adopted row is renamed and gets the union of both tag sets; its
    /// status and last_seen are left alone. A new row starts offline and
    /// never seen.
    #[tracing::instrument(skip(self, tags))]
    pub async fn add_host(&self, name: &str, ip: &str, tags: Vec<String>) -> Result<Host> {
        let ip = normalize_ip(ip);
        if ip.is_empty() {
            return Err(Error::Validation("host IP cannot be empty".to_string()));
        }

        let id = match self.preferred_host_for(&ip).await? {
            Some(host) => {
                let merged = identity::merge_tags(&host.tags, &tags);
                self.catalog.relabel_host(&host.id, name, merged).await?;
                host.id
            }
            None => {
                let now = Utc::now();
                let id = uuid::Uuid::new_v4().to_string();
                self.catalog
                    .insert_host(Host {
                        id: id.clone(),
                        name: name.to_string(),
                        ip,
                        status: HostStatus::Offline,
                        last_seen: None,
                        tags,
                        resources: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                info!("Added host '{}' as {}", name, id);
                id
            }
        };

        self.catalog
            .get_host(&id)
            .await?
            .ok_or(Error::HostNotFound(id))
    }

    /// Delete a host and its containers.
    pub async fn delete_host(&self, id: &str) -> Result<()> {
        if !self.catalog.delete_host(id).await? {
            return Err(Error::HostNotFound(id.to_string()));
        }
        self.catalog.recompute_system_status().await?;
        Ok(())
    }

    pub async fn list_containers(&self, host_id: Option<&str>) -> Result<Vec<ManagedContainer>> {
        self.catalog.list_containers(host_id).await
    }

    async fn known_container(&self, id: &str) -> Result<ManagedContainer> {
        self.catalog
            .get_container(id)
            .await?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// Remove from the runtime, then from the catalog. A container the runtime
    /// already forgot is still dropped from the catalog.
    #[tracing::instrument(skip(self))]
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        self.known_container(id).await?;
        match self.runtime.remove(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Container {} already gone from runtime", id),
            Err(e) => return Err(e.into()),
        }
        let _ = self.catalog.delete_container(id).await?;
        self.catalog.recompute_system_status().await?;
        Ok(())
    }

    /// Start a stopped container, then refresh the catalog from the runtime.
    #[tracing::instrument(skip(self))]
    pub async fn start_container(&self, id: &str) -> Result<SyncOutcome> {
        self.known_container(id).await?;
        self.runtime.start(id).await.map_err(not_found_as(id))?;
        self.sync_containers().await
    }

    /// Stop a running container, then refresh the catalog from the runtime.
    #[tracing::instrument(skip(self))]
    pub async fn stop_container(&self, id: &str) -> Result<SyncOutcome> {
        self.known_container(id).await?;
        self.runtime.stop(id).await.map_err(not_found_as(id))?;
        self.sync_containers().await
    }

    #[tracing::instrument(skip(self, cmd))]
    pub async fn exec_in_container(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(Error::Validation("exec needs a command".to_string()));
        }
        self.known_container(id).await?;
        self.runtime.exec(id, cmd).await.map_err(not_found_as(id))
    }

    pub async fn get_container_logs(&self, id: &str, tail: usize) -> Result<String> {
        self.known_container(id).await?;
        self.runtime.logs(id, tail).await.map_err(not_found_as(id))
    }

    pub async fn system_status(&self) -> Result<SystemStatus> {
        self.catalog.system_status().await
    }
}

fn not_found_as(id: &str) -> impl FnOnce(DockerError) -> Error + '_ {
    move |e| {
        if e.is_not_found() {
            Error::ContainerNotFound(id.to_string())
        } else {
            e.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PortBinding;

    fn live(id: &str, status: ContainerStatus) -> RuntimeContainer {
        RuntimeContainer::new(id, "nginx:latest", status)
    }

    fn stored(id: &str, status: ContainerStatus) -> ManagedContainer {
        to_managed("h1", &live(id, status), Utc::now())
    }

    #[test]
    fn diff_inserts_updates_and_deletes() {
        let persisted = vec![
            stored("same", ContainerStatus::Running),
            stored("changed", ContainerStatus::Running),
            stored("gone", ContainerStatus::Exited),
        ];
        let current = vec![
            live("same", ContainerStatus::Running),
            live("changed", ContainerStatus::Exited),
            live("new", ContainerStatus::Created),
        ];

        let changes = diff_containers("h1", &persisted, &current, Utc::now());
        assert_eq!(changes.host_id, "h1");
        assert_eq!(changes.inserts.len(), 1);
        assert_eq!(changes.inserts[0].id, "new");
        assert_eq!(
            changes.status_updates,
            vec![("changed".to_string(), ContainerStatus::Exited)]
        );
        assert_eq!(changes.deletes, vec!["gone".to_string()]);
    }

    #[test]
    fn diff_of_converged_state_is_empty() {
        let persisted = vec![stored("a", ContainerStatus::Running)];
        let current = vec![live("a", ContainerStatus::Running)];
        assert!(diff_containers("h1", &persisted, &current, Utc::now()).is_empty());
    }

    #[test]
    fn insert_captures_runtime_details() {
        let mut c = live("web", ContainerStatus::Exited);
        c.name = "web-1".to_string();
        c.ports.push(PortBinding {
            container_port: 80,
            protocol: "tcp".to_string(),
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(8080),
        });
        c.labels.insert("app".to_string(), "web".to_string());
        c.exit_code = Some(137);

        let changes = diff_containers("h1", &[], &[c], Utc::now());
        let inserted = &changes.inserts[0];
        assert_eq!(inserted.name, "web-1");
        assert_eq!(inserted.host_id, "h1");
        assert_eq!(inserted.ports[0].host_port, Some(8080));
        assert_eq!(inserted.labels["app"], "web");
        assert_eq!(inserted.exit_code, Some(137));
    }
}
