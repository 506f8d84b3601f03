//! Persisted Host and Container rows plus the SystemStatus singleton.

use super::sqlite::{
    now_timestamp, parse_enum, parse_json, parse_opt_timestamp, parse_timestamp, timestamp,
    to_json, Store,
};
use super::types::{
    ContainerStatus, Host, HostResources, HostStatus, ManagedContainer, SystemStatus,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::debug;

const HOST_COLUMNS: &str =
    "id, name, ip, status, last_seen, tags, resources, created_at, updated_at";

const CONTAINER_COLUMNS: &str = "id, name, image, host_id, status, ports, volumes, environment, \
     labels, created_at, updated_at, started_at, stopped_at, exit_code";

/// Fields refreshed on an existing host during registration.
#[derive(Debug, Clone)]
pub struct HostRefresh {
    pub name: String,
    pub status: HostStatus,
    pub last_seen: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// One sync pass worth of container changes for a single host.
#[derive(Debug, Clone, Default)]
pub struct ContainerChanges {
    pub host_id: String,
    pub inserts: Vec<ManagedContainer>,
    /// (container id, new status)
    pub status_updates: Vec<(String, ContainerStatus)>,
    pub deletes: Vec<String>,
}

impl ContainerChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.status_updates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Clone)]
pub struct Catalog {
    store: Store,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ---- hosts ----

    /// All hosts, oldest first.
    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM hosts ORDER BY created_at, id",
                    HOST_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_host)?;
                rows.collect()
            })
            .await
    }

    pub async fn get_host(&self, id: &str) -> Result<Option<Host>> {
        let id = id.to_string();
        self.store
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM hosts WHERE id = ?1", HOST_COLUMNS),
                    rusqlite::params![id],
                    row_to_host,
                )
                .optional()
            })
            .await
    }

    pub async fn hosts_by_ip(&self, ip: &str) -> Result<Vec<Host>> {
        let ip = ip.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM hosts WHERE ip = ?1 ORDER BY created_at, id",
                    HOST_COLUMNS
                ))?;
                let rows = stmt.query_map(rusqlite::params![ip], row_to_host)?;
                rows.collect()
            })
            .await
    }

    #[must_use = "catalog write errors must be handled"]
    pub async fn insert_host(&self, host: Host) -> Result<()> {
        self.store
            .with_transaction(move |tx| {
                tx.execute(
                    &format!(
                        "INSERT INTO hosts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        HOST_COLUMNS
                    ),
                    rusqlite::params![
                        host.id,
                        host.name,
                        host.ip,
                        host.status.as_str(),
                        host.last_seen.map(timestamp),
                        to_json(&host.tags)?,
                        host.resources.as_ref().map(to_json).transpose()?,
                        timestamp(host.created_at),
                        timestamp(host.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Refresh name, status, last_seen and tags of an existing host.
    #[must_use = "catalog write errors must be handled"]
    pub async fn refresh_host(&self, id: &str, refresh: HostRefresh) -> Result<bool> {
        let id = id.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE hosts SET name = ?2, status = ?3, last_seen = ?4, tags = ?5, updated_at = ?6
                     WHERE id = ?1",
                    rusqlite::params![
                        id,
                        refresh.name,
                        refresh.status.as_str(),
                        timestamp(refresh.last_seen),
                        to_json(&refresh.tags)?,
                        now,
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Rename a host and replace its tags, leaving status and last_seen alone.
    #[must_use = "catalog write errors must be handled"]
    pub async fn relabel_host(&self, id: &str, name: &str, tags: Vec<String>) -> Result<bool> {
        let id = id.to_string();
        let name = name.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE hosts SET name = ?2, tags = ?3, updated_at = ?4 WHERE id = ?1",
                    rusqlite::params![id, name, to_json(&tags)?, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    #[must_use = "catalog write errors must be handled"]
    pub async fn update_host_resources(&self, id: &str, resources: HostResources) -> Result<bool> {
        let id = id.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE hosts SET resources = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, to_json(&resources)?, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Delete a host and (by cascade) its containers.
    #[must_use = "catalog write errors must be handled"]
    pub async fn delete_host(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute("DELETE FROM hosts WHERE id = ?1", rusqlite::params![id])?;
                Ok(changed > 0)
            })
            .await
    }

    /// Re-point containers of `duplicates` at `survivor`, then delete the duplicates.
    /// Both steps share one transaction.
    #[must_use = "catalog write errors must be handled"]
    pub async fn merge_hosts(&self, survivor: &str, duplicates: Vec<String>) -> Result<usize> {
        let survivor = survivor.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let mut removed = 0;
                for dup in &duplicates {
                    let moved = tx.execute(
                        "UPDATE containers SET host_id = ?1, updated_at = ?3 WHERE host_id = ?2",
                        rusqlite::params![survivor, dup, now],
                    )?;
                    if moved > 0 {
                        debug!("Re-pointed {} container(s) from host {} to {}", moved, dup, survivor);
                    }
                    removed += tx.execute("DELETE FROM hosts WHERE id = ?1", rusqlite::params![dup])?;
                }
                Ok(removed)
            })
            .await
    }

    // ---- containers ----

    pub async fn list_containers(&self, host_id: Option<&str>) -> Result<Vec<ManagedContainer>> {
        let host_id = host_id.map(str::to_string);
        self.store
            .read(move |conn| match host_id {
                Some(host_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM containers WHERE host_id = ?1 ORDER BY name, id",
                        CONTAINER_COLUMNS
                    ))?;
                    let rows = stmt.query_map(rusqlite::params![host_id], row_to_container)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM containers ORDER BY host_id, name, id",
                        CONTAINER_COLUMNS
                    ))?;
                    let rows = stmt.query_map([], row_to_container)?;
                    rows.collect()
                }
            })
            .await
    }

    pub async fn get_container(&self, id: &str) -> Result<Option<ManagedContainer>> {
        let id = id.to_string();
        self.store
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM containers WHERE id = ?1", CONTAINER_COLUMNS),
                    rusqlite::params![id],
                    row_to_container,
                )
                .optional()
            })
            .await
    }

    #[must_use = "catalog write errors must be handled"]
    pub async fn delete_container(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.store
            .with_transaction(move |tx| {
                let changed =
                    tx.execute("DELETE FROM containers WHERE id = ?1", rusqlite::params![id])?;
                Ok(changed > 0)
            })
            .await
    }

    /// Apply one sync pass atomically.
    ///
    /// An inserted id that already exists under another host is moved to
    /// `changes.host_id`: the runtime listing is authoritative.
    #[must_use = "catalog write errors must be handled"]
    pub async fn apply_container_changes(&self, changes: ContainerChanges) -> Result<()> {
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                for c in &changes.inserts {
                    tx.execute(
                        &format!(
                            "INSERT INTO containers ({}) VALUES
                             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                             ON CONFLICT(id) DO UPDATE SET
                                 host_id = excluded.host_id,
                                 status = excluded.status,
                                 updated_at = excluded.updated_at",
                            CONTAINER_COLUMNS
                        ),
                        rusqlite::params![
                            c.id,
                            c.name,
                            c.image,
                            changes.host_id,
                            c.status.as_str(),
                            to_json(&c.ports)?,
                            to_json(&c.volumes)?,
                            to_json(&c.environment)?,
                            to_json(&c.labels)?,
                            timestamp(c.created_at),
                            timestamp(c.updated_at),
                            c.started_at.map(timestamp),
                            c.stopped_at.map(timestamp),
                            c.exit_code,
                        ],
                    )?;
                }
                for (id, status) in &changes.status_updates {
                    tx.execute(
                        "UPDATE containers SET status = ?2, updated_at = ?3 WHERE id = ?1",
                        rusqlite::params![id, status.as_str(), now],
                    )?;
                }
                for id in &changes.deletes {
                    tx.execute(
                        "DELETE FROM containers WHERE id = ?1 AND host_id = ?2",
                        rusqlite::params![id, changes.host_id],
                    )?;
                }
                Ok(())
            })
            .await
    }

    // ---- system status ----

    /// Recount hosts, containers and services and persist the singleton.
    #[must_use = "catalog write errors must be handled"]
    pub async fn recompute_system_status(&self) -> Result<SystemStatus> {
        let now = Utc::now();
        self.store
            .with_transaction(move |tx| {
                let count = |sql: &str| -> rusqlite::Result<u32> {
                    tx.query_row(sql, [], |row| row.get(0))
                };
                let status = SystemStatus {
                    total_hosts: count("SELECT COUNT(*) FROM hosts")?,
                    online_hosts: count("SELECT COUNT(*) FROM hosts WHERE status = 'online'")?,
                    total_containers: count("SELECT COUNT(*) FROM containers")?,
                    running_containers: count(
                        "SELECT COUNT(*) FROM containers WHERE status = 'running'",
                    )?,
                    total_services: count("SELECT COUNT(*) FROM services")?,
                    running_services: count(
                        "SELECT COUNT(*) FROM services WHERE status = 'running'",
                    )?,
                    updated_at: Some(now),
                };
                tx.execute(
                    "INSERT INTO system_status (id, total_hosts, online_hosts, total_containers,
                         running_containers, total_services, running_services, updated_at)
                     VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                         total_hosts = excluded.total_hosts,
                         online_hosts = excluded.online_hosts,
                         total_containers = excluded.total_containers,
                         running_containers = excluded.running_containers,
                         total_services = excluded.total_services,
                         running_services = excluded.running_services,
                         updated_at = excluded.updated_at",
                    rusqlite::params![
                        status.total_hosts,
                        status.online_hosts,
                        status.total_containers,
                        status.running_containers,
                        status.total_services,
                        status.running_services,
                        timestamp(now),
                    ],
                )?;
                Ok(status)
            })
            .await
    }

    /// Last persisted aggregate, or zeros if no pass has run yet.
    pub async fn system_status(&self) -> Result<SystemStatus> {
        self.store
            .read(|conn| {
                conn.query_row(
                    "SELECT total_hosts, online_hosts, total_containers, running_containers,
                            total_services, running_services, updated_at
                     FROM system_status WHERE id = 1",
                    [],
                    |row| {
                        let updated_at: String = row.get(6)?;
                        Ok(SystemStatus {
                            total_hosts: row.get(0)?,
                            online_hosts: row.get(1)?,
                            total_containers: row.get(2)?,
                            running_containers: row.get(3)?,
                            total_services: row.get(4)?,
                            running_services: row.get(5)?,
                            updated_at: Some(parse_timestamp(6, &updated_at)?),
                        })
                    },
                )
                .optional()
                .map(Option::unwrap_or_default)
            })
            .await
    }
}

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<Host> {
    let status: String = row.get(3)?;
    let tags: String = row.get(5)?;
    let resources: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        status: parse_enum(3, &status)?,
        last_seen: parse_opt_timestamp(4, row.get(4)?)?,
        tags: parse_json(5, &tags)?,
        resources: resources.map(|r| parse_json(6, &r)).transpose()?,
        created_at: parse_timestamp(7, &created_at)?,
        updated_at: parse_timestamp(8, &updated_at)?,
    })
}

fn row_to_container(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagedContainer> {
    let status: String = row.get(4)?;
    let ports: String = row.get(5)?;
    let volumes: String = row.get(6)?;
    let environment: String = row.get(7)?;
    let labels: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(ManagedContainer {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        host_id: row.get(3)?,
        status: ContainerStatus::parse(&status),
        ports: parse_json(5, &ports)?,
        volumes: parse_json(6, &volumes)?,
        environment: parse_json(7, &environment)?,
        labels: parse_json(8, &labels)?,
        created_at: parse_timestamp(9, &created_at)?,
        updated_at: parse_timestamp(10, &updated_at)?,
        started_at: parse_opt_timestamp(11, row.get(11)?)?,
        stopped_at: parse_opt_timestamp(12, row.get(12)?)?,
        exit_code: row.get(13)?,
    })
}
