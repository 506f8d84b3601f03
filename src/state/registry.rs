//! Persisted per-service status rows.
//!
//! Pure data access: every method is one short transaction. Liveness decisions
//! belong to the supervisor; the conditional writes here (`mark_dead_if_pid`,
//! `touch_heartbeat`, `mark_running`) only apply when the row still holds the
//! pid the caller observed, so a sweep never clobbers a newer start.

use super::sqlite::{
    now_timestamp, parse_enum, parse_opt_timestamp, parse_timestamp, timestamp, Store,
};
use super::types::{ManagedService, ServiceStatus, ServiceType};
use crate::error::Result;
use chrono::Utc;
use rusqlite::OptionalExtension;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE_COLUMNS: &str = "name, service_type, status, pid, port, host, started_at, \
     stopped_at, last_heartbeat, error_count, last_error, config_snapshot, created_at, updated_at";

/// Fields written when a freshly spawned process enters `starting`.
#[derive(Debug, Clone)]
pub struct StartingRecord {
    pub name: String,
    pub service_type: ServiceType,
    pub pid: u32,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub config_snapshot: Option<String>,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    store: Store,
}

impl ServiceRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, name: &str) -> Result<Option<ManagedService>> {
        let name = name.to_string();
        self.store
            .read(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM services WHERE name = ?1", SERVICE_COLUMNS),
                    rusqlite::params![name],
                    row_to_service,
                )
                .optional()
            })
            .await
    }

    /// All rows, ordered by name.
    pub async fn list(&self) -> Result<Vec<ManagedService>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM services ORDER BY name",
                    SERVICE_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_service)?;
                rows.collect()
            })
            .await
    }

    pub async fn list_by_status(&self, status: ServiceStatus) -> Result<Vec<ManagedService>> {
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM services WHERE status = ?1 ORDER BY name",
                    SERVICE_COLUMNS
                ))?;
                let rows = stmt.query_map(rusqlite::params![status.as_str()], row_to_service)?;
                rows.collect()
            })
            .await
    }

    /// Create or overwrite the row as `starting` with the spawned pid.
    ///
    /// `error_count`, `last_error` and `created_at` survive from a previous row.
    #[must_use = "registry write errors must be handled"]
    pub async fn mark_starting(&self, record: StartingRecord) -> Result<()> {
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                tx.execute(
                    "INSERT INTO services (name, service_type, status, pid, port, host, started_at,
                         stopped_at, last_heartbeat, config_snapshot, created_at, updated_at)
                     VALUES (?1, ?2, 'starting', ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?6, ?6)
                     ON CONFLICT(name) DO UPDATE SET
                         service_type = excluded.service_type,
                         status = 'starting',
                         pid = excluded.pid,
                         port = excluded.port,
                         host = excluded.host,
                         started_at = excluded.started_at,
                         stopped_at = NULL,
                         last_heartbeat = NULL,
                         config_snapshot = excluded.config_snapshot,
                         updated_at = excluded.updated_at",
                    rusqlite::params![
                        record.name,
                        record.service_type.as_str(),
                        record.pid,
                        record.port,
                        record.host,
                        now,
                        record.config_snapshot,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Promote a `starting` row to `running`. Returns false if the row no
    /// longer holds `pid`.
    #[must_use = "registry write errors must be handled"]
    pub async fn mark_running(&self, name: &str, pid: u32) -> Result<bool> {
        let name = name.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE services SET status = 'running', last_heartbeat = ?3, updated_at = ?3
                     WHERE name = ?1 AND pid = ?2 AND status IN ('starting', 'running')",
                    rusqlite::params![name, pid, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Record a failure: status `error`, pid cleared, `error_count` incremented.
    ///
    /// Creates the row if it does not exist yet so a launch that fails before
    /// the first registry write still leaves a trace.
    #[must_use = "registry write errors must be handled"]
    pub async fn mark_error(
        &self,
        name: &str,
        service_type: ServiceType,
        message: &str,
    ) -> Result<()> {
        let name = name.to_string();
        let message = message.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                tx.execute(
                    "INSERT INTO services (name, service_type, status, pid, stopped_at, error_count,
                         last_error, created_at, updated_at)
                     VALUES (?1, ?2, 'error', NULL, ?4, 1, ?3, ?4, ?4)
                     ON CONFLICT(name) DO UPDATE SET
                         status = 'error',
                         pid = NULL,
                         stopped_at = excluded.stopped_at,
                         error_count = services.error_count + 1,
                         last_error = excluded.last_error,
                         updated_at = excluded.updated_at",
                    rusqlite::params![name, service_type.as_str(), message, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Set an existing row to `stopped` and clear its pid. Idempotent: an
    /// already stopped row keeps its original `stopped_at`. Returns false when
    /// no row exists.
    #[must_use = "registry write errors must be handled"]
    pub async fn mark_stopped(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE services SET
                         status = 'stopped',
                         pid = NULL,
                         stopped_at = CASE WHEN status = 'stopped' THEN stopped_at ELSE ?2 END,
                         updated_at = CASE WHEN status = 'stopped' THEN updated_at ELSE ?2 END
                     WHERE name = ?1",
                    rusqlite::params![name, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Transition a live row to `stopped` only if it still records `pid`.
    #[must_use = "registry write errors must be handled"]
    pub async fn mark_dead_if_pid(&self, name: &str, pid: u32) -> Result<bool> {
        let name = name.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE services SET status = 'stopped', pid = NULL, stopped_at = ?3, updated_at = ?3
                     WHERE name = ?1 AND pid = ?2 AND status IN ('starting', 'running')",
                    rusqlite::params![name, pid, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Advance `last_heartbeat` for a running row that still records `pid`.
    #[must_use = "registry write errors must be handled"]
    pub async fn touch_heartbeat(&self, name: &str, pid: u32) -> Result<bool> {
        let name = name.to_string();
        let now = now_timestamp();
        self.store
            .with_transaction(move |tx| {
                let changed = tx.execute(
                    "UPDATE services SET last_heartbeat = ?3
                     WHERE name = ?1 AND pid = ?2 AND status = 'running'",
                    rusqlite::params![name, pid, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Delete terminal rows (`stopped` / `error`) whose last transition is
    /// older than `older_than`. Live rows are never purged.
    #[must_use = "registry write errors must be handled"]
    pub async fn purge_stale(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .map(timestamp)
            .unwrap_or_default();
        let removed = self
            .store
            .with_transaction(move |tx| {
                tx.execute(
                    "DELETE FROM services
                     WHERE status IN ('stopped', 'error') AND updated_at < ?1",
                    rusqlite::params![cutoff],
                )
            })
            .await?;

        if removed > 0 {
            info!("Purged {} stale service record(s)", removed);
        } else {
            debug!("No stale service records to purge");
        }
        Ok(removed)
    }
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagedService> {
    let service_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(ManagedService {
        name: row.get(0)?,
        service_type: parse_enum(1, &service_type)?,
        status: parse_enum(2, &status)?,
        pid: row.get(3)?,
        port: row.get(4)?,
        host: row.get(5)?,
        started_at: parse_opt_timestamp(6, row.get(6)?)?,
        stopped_at: parse_opt_timestamp(7, row.get(7)?)?,
        last_heartbeat: parse_opt_timestamp(8, row.get(8)?)?,
        error_count: row.get(9)?,
        last_error: row.get(10)?,
        config_snapshot: row.get(11)?,
        created_at: parse_timestamp(12, &created_at)?,
        updated_at: parse_timestamp(13, &updated_at)?,
    })
}
