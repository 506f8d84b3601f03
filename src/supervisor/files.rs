//! Per-service pid and log files under `<data_dir>/services/`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes read from the end of a log when tailing.
const TAIL_WINDOW: u64 = 256 * 1024;

/// File stem used for a service's pid and log files.
///
/// Only `[A-Za-z0-9_-]` names are accepted and the stem is the name itself, so
/// two services never share a pid file or a log file.
pub fn service_file_stem(service_name: &str) -> Result<String> {
    if service_name.is_empty() {
        return Err(Error::Config("Service name cannot be empty".to_string()));
    }

    if let Some(bad) = service_name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::Config(format!(
            "Service name '{}' contains '{}'; only ASCII letters, digits, '-' and '_' are allowed",
            service_name, bad
        )));
    }

    Ok(service_name.to_string())
}

/// Write via temp file + fsync + rename so readers never see a partial file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Pid recorded in a pid file, with the file's mtime as the spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub written_at: Option<DateTime<Utc>>,
}

/// Locations of one data directory's service files.
#[derive(Debug, Clone)]
pub struct ServiceFiles {
    dir: PathBuf,
}

impl ServiceFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn pid_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.pid", service_file_stem(name)?)))
    }

    pub fn stdout_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.out.log", service_file_stem(name)?)))
    }

    pub fn stderr_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.err.log", service_file_stem(name)?)))
    }

    pub fn write_pid(&self, name: &str, pid: u32) -> Result<()> {
        self.ensure_dir()?;
        atomic_write(&self.pid_path(name)?, &format!("{}\n", pid))
    }

    /// `None` when the file is missing or does not hold a pid.
    pub fn read_pid(&self, name: &str) -> Option<PidRecord> {
        let path = self.pid_path(name).ok()?;
        let contents = fs::read_to_string(&path).ok()?;
        let pid = contents.trim().parse::<u32>().ok()?;
        let written_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Some(PidRecord { pid, written_at })
    }

    /// Remove the pid file; a missing file is fine.
    pub fn remove_pid(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.pid_path(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Last `lines` lines of a file. Missing files yield an empty tail.
pub fn tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut all: Vec<&str> = text.lines().collect();
    // The first line of a window that starts mid-file is partial
    if start > 0 && !all.is_empty() {
        all.remove(0);
    }
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stem_rejects_traversal_and_odd_chars() {
        assert!(service_file_stem("").is_err());
        assert!(service_file_stem("../x").is_err());
        assert!(service_file_stem("a\\b").is_err());
        assert!(service_file_stem(".hidden").is_err());
        assert!(service_file_stem("mcp server:1").is_err());
        assert!(service_file_stem("caf\u{e9}").is_err());
        assert_eq!(service_file_stem("infra-api").unwrap(), "infra-api");
        assert_eq!(service_file_stem("mcp_server_1").unwrap(), "mcp_server_1");
    }

    #[test]
    fn distinct_names_never_share_files() {
        // `agent.1` would otherwise land on `agent_1`'s files
        assert!(service_file_stem("agent.1").is_err());
        let files = ServiceFiles::new("/tmp/fleet/services");
        assert_ne!(
            files.pid_path("agent_1").unwrap(),
            files.pid_path("agent-1").unwrap()
        );
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let files = ServiceFiles::new(dir.path().join("services"));
        assert!(files.read_pid("api").is_none());

        files.write_pid("api", 4242).unwrap();
        let record = files.read_pid("api").unwrap();
        assert_eq!(record.pid, 4242);
        assert!(record.written_at.is_some());

        files.remove_pid("api").unwrap();
        assert!(files.read_pid("api").is_none());
        // idempotent
        files.remove_pid("api").unwrap();
    }

    #[test]
    fn garbage_pid_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let files = ServiceFiles::new(dir.path());
        fs::write(files.pid_path("api").unwrap(), "not-a-pid").unwrap();
        assert!(files.read_pid("api").is_none());
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.log");
        fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(tail(&path, 2).unwrap(), vec!["three", "four"]);
        assert_eq!(tail(&path, 10).unwrap().len(), 4);
        assert!(tail(&path, 0).unwrap().is_empty());
        assert!(tail(&dir.path().join("missing.log"), 5).unwrap().is_empty());
    }

    #[test]
    fn tail_of_large_file_drops_partial_first_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.log");
        let line = "x".repeat(1000);
        let body: String = (0..600).map(|i| format!("{}-{}\n", i, line)).collect();
        fs::write(&path, body).unwrap();

        let last = tail(&path, 3).unwrap();
        assert_eq!(last.len(), 3);
        assert!(last[2].starts_with("599-"));
    }
}
