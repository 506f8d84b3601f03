use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

pub(crate) const DB_FILE_NAME: &str = "fleet.db";
const LOCK_FILE_NAME: &str = ".lock";
const SCHEMA_VERSION: i32 = 1;

/// How a [`Store`] treats the data directory's advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Take the lock, warning when a live supervisor already holds it.
    Exclusive,
    /// Leave the lock alone. For callers that only read.
    Shared,
}

/// SQLite-backed store shared by the service registry and the host/container catalog.
///
/// WAL mode with `synchronous=NORMAL` gives crash recovery for the registry rows.
/// An advisory lock file (`<data_dir>/.lock`) warns when a second supervisor
/// opens the same data directory; the lock is released when the last clone of
/// the store is dropped.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    conn: Connection,
    lock_file: Option<std::sync::Arc<std::fs::File>>,
}

impl Store {
    /// Open (creating if needed) the store under `data_dir`, taking the lock.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Self::open_with(data_dir, LockMode::Exclusive).await
    }

    pub async fn open_with(data_dir: &Path, mode: LockMode) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let lock_file = match mode {
            LockMode::Exclusive => Self::try_acquire_lock(&data_dir.join(LOCK_FILE_NAME))?,
            LockMode::Shared => None,
        };
        let db_path = data_dir.join(DB_FILE_NAME);

        let conn = Connection::open(&db_path).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let store = Self {
            db_path,
            conn,
            lock_file: lock_file.map(std::sync::Arc::new),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store with no lock file. Used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;

        let store = Self {
            db_path: PathBuf::from(":memory:"),
            conn,
            lock_file: None,
        };
        store.initialize().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether this store holds the data directory's advisory lock.
    pub fn holds_lock(&self) -> bool {
        self.lock_file.is_some()
    }

    /// Try to acquire the advisory lock. Never fails on contention: another
    /// live holder only produces a warning.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Ok(Some(file))
            }
            Err(e) => {
                debug!("Lock acquisition failed: {} (kind: {:?})", e, e.kind());
                let owner = std::fs::read_to_string(lock_path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match owner {
                    Some(pid) if pid == std::process::id() => {
                        debug!("Lock held by this process (store reopened)");
                    }
                    Some(pid) if crate::supervisor::os::is_alive(pid) => {
                        warn!(
                            "Another fleet supervisor (PID {}) is using this data directory. \
                             Proceeding anyway, but registry writes may interleave.",
                            pid
                        );
                    }
                    Some(pid) => {
                        debug!("Stale lock file (PID {} no longer exists) - proceeding", pid);
                    }
                    None => debug!("Could not acquire lock ({}) - proceeding anyway", e),
                }
                Ok(None)
            }
        }
    }

    /// Run `f` on the connection thread.
    pub(crate) async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| Ok(f(conn)?))
            .await
            .map_err(Error::from)
    }

    /// Execute `f` inside a short transaction and commit.
    #[tracing::instrument(skip(self, f), fields(operation = "db_transaction"))]
    pub(crate) async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(Error::from)
    }

    async fn initialize(&self) -> Result<()> {
        let schema_exists: bool = self
            .read(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
                    [],
                    |row| row.get(0),
                )
            })
            .await?;

        if schema_exists {
            let version: i32 = self
                .read(|conn| {
                    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                        row.get::<_, Option<i32>>(0)
                    })
                    .map(|v| v.unwrap_or(0))
                })
                .await?;
            if version > SCHEMA_VERSION {
                return Err(Error::Config(format!(
                    "Database {} has schema version {} but this build understands up to {}",
                    self.db_path.display(),
                    version,
                    SCHEMA_VERSION
                )));
            }
            debug!("Loaded existing store (schema v{})", version);
            return Ok(());
        }

        debug!("Creating SQLite schema");
        self.create_schema().await
    }

    async fn create_schema(&self) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE services (
                    name TEXT PRIMARY KEY,
                    service_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    pid INTEGER,
                    port INTEGER,
                    host TEXT,
                    started_at TEXT,
                    stopped_at TEXT,
                    last_heartbeat TEXT,
                    error_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    config_snapshot TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    CHECK ((pid IS NOT NULL) = (status IN ('starting', 'running')))
                );

                CREATE INDEX idx_services_status ON services(status);

                -- No UNIQUE on ip: duplicates are repaired by the dedupe sweep.
                CREATE TABLE hosts (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    status TEXT NOT NULL,
                    last_seen TEXT,
                    tags TEXT NOT NULL DEFAULT '[]',
                    resources TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX idx_hosts_ip ON hosts(ip);

                CREATE TABLE containers (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    image TEXT NOT NULL,
                    host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    ports TEXT NOT NULL DEFAULT '[]',
                    volumes TEXT NOT NULL DEFAULT '[]',
                    environment TEXT NOT NULL DEFAULT '{}',
                    labels TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT,
                    exit_code INTEGER
                );

                CREATE INDEX idx_containers_host ON containers(host_id);

                CREATE TABLE system_status (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    total_hosts INTEGER NOT NULL,
                    online_hosts INTEGER NOT NULL,
                    total_containers INTEGER NOT NULL,
                    running_containers INTEGER NOT NULL,
                    total_services INTEGER NOT NULL,
                    running_services INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
            )?;

            // Placeholders are not allowed in execute_batch
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, now_timestamp()],
            )?;
            Ok(())
        })
        .await
    }
}

/// Fixed-width RFC 3339 (UTC, microseconds) so TEXT comparison orders chronologically.
pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse an RFC 3339 column, surfacing bad data as a conversion error.
pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_timestamp(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_timestamp(idx, &s)).transpose()
}

/// Parse a TEXT column holding a string enum (`FromStr<Err = String>`).
pub(crate) fn parse_enum<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Parse a JSON TEXT column.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    s: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_creates_schema_and_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open(temp_dir.path()).await.unwrap();
        assert!(store.db_path().ends_with(DB_FILE_NAME));
        drop(store);

        // Second open sees the existing schema
        let store = Store::open(temp_dir.path()).await.unwrap();
        let version: i32 = store
            .read(|conn| conn.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn second_store_on_same_dir_does_not_fail() {
        let temp_dir = TempDir::new().unwrap();
        let first = Store::open(temp_dir.path()).await.unwrap();
        assert!(first.holds_lock());
        let second = Store::open(temp_dir.path()).await.unwrap();
        assert!(!second.holds_lock());
    }

    #[tokio::test]
    async fn shared_open_leaves_lock_to_writers() {
        let temp_dir = TempDir::new().unwrap();
        let reader = Store::open_with(temp_dir.path(), LockMode::Shared).await.unwrap();
        assert!(!reader.holds_lock());

        // A writer opened afterwards still gets the lock
        let writer = Store::open(temp_dir.path()).await.unwrap();
        assert!(writer.holds_lock());

        // and a reader next to a running writer neither takes nor needs it
        let reader = Store::open_with(temp_dir.path(), LockMode::Shared).await.unwrap();
        assert!(!reader.holds_lock());
        assert_eq!(reader.catalog().list_hosts().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn pid_status_check_constraint_rejects_inconsistent_rows() {
        let store = Store::open_in_memory().await.unwrap();
        let now = now_timestamp();
        let result = store
            .with_transaction(move |tx| {
                tx.execute(
                    "INSERT INTO services (name, service_type, status, pid, created_at, updated_at)
                     VALUES ('x', 'agent', 'stopped', 42, ?1, ?1)",
                    rusqlite::params![now],
                )
            })
            .await;
        assert!(result.is_err());
    }
}
