// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::docker::DockerError;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(fleet::config::error),
        help("Check fleet.yaml, or pass an explicit path with `fleet -c <file>`")
    )]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Container runtime error: {0}")]
    #[diagnostic(
        code(fleet::runtime::error),
        help("Check that Docker is running with `docker ps`")
    )]
    Runtime(#[from] DockerError),

    #[error("Process error: {0}")]
    #[diagnostic(
        code(fleet::process::error),
        help("Check that the command exists and is executable")
    )]
    Process(String),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(fleet::service::not_found),
        help("List known services with `fleet status`")
    )]
    ServiceNotFound(String),

    #[error("No launch recipe for service '{name}' ({reason})")]
    #[diagnostic(
        code(fleet::service::no_recipe),
        help("Add a recipe for the service under `services:` in fleet.yaml")
    )]
    NoLaunchRecipe { name: String, reason: String },

    #[error("Host not found: {0}")]
    #[diagnostic(code(fleet::host::not_found), help("List hosts with `fleet host list`"))]
    HostNotFound(String),

    #[error("Container not found: {0}")]
    #[diagnostic(
        code(fleet::container::not_found),
        help("Refresh the catalog with `fleet container sync`")
    )]
    ContainerNotFound(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(fleet::config::validation))]
    Validation(String),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(fleet::database::error),
        help("See recovery suggestions based on the specific error type")
    )]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Timeout waiting for '{0}'")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Rusqlite(e))
    }
}

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ServiceNotFound(name) => Some(format!(
                "Start it first with 'fleet start {}', or check 'fleet status' for known services.",
                name
            )),
            Error::NoLaunchRecipe { name, .. } => Some(format!(
                "Declare a recipe for '{}' in fleet.yaml:\n\nservices:\n  {}:\n    type: agent\n    program: /path/to/binary",
                name, name
            )),
            Error::Config(msg) if msg.contains("Could not find") => None,
            Error::Config(_) | Error::Validation(_) => {
                Some("Check the syntax and values in fleet.yaml".to_string())
            }
            Error::Runtime(e) if e.is_unavailable() => {
                Some("The container runtime is unreachable. Check: docker ps".to_string())
            }
            Error::Process(_) => {
                Some("Check that the command exists and is executable".to_string())
            }
            Error::Database(e) => {
                // tokio_rusqlite wraps the rusqlite error opaquely, so match on the message.
                let err_str = e.to_string();
                if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                    Some(
                        "Another fleet supervisor may be writing to this data directory. Stop it, or check for a stale .fleet/.lock".to_string(),
                    )
                } else if err_str.contains("database disk image is malformed")
                    || err_str.contains("SQLITE_CORRUPT")
                {
                    Some(
                        "Database corrupted. Back up .fleet/fleet.db and try:\n  sqlite3 .fleet/fleet.db '.recover' | sqlite3 .fleet/fleet.recovered.db".to_string(),
                    )
                } else {
                    Some(
                        "If the issue persists, remove the .fleet/ directory. Running services will need to be restarted.".to_string(),
                    )
                }
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid for signal delivery.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, service_name: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}', cannot convert safely",
                pid, service_name
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1 for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

/// Query the kernel clock tick rate (jiffies per second).
///
/// Falls back to 100 (the common default) if sysconf fails.
#[cfg(target_os = "linux")]
fn get_clock_ticks_per_sec() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(100)
}

/// Check if a PID still belongs to the process recorded at `expected_start`.
///
/// Returns false only when the PID was clearly reused by a different process
/// (start times differ by more than 60 seconds). When the start time cannot be
/// determined the PID is trusted.
pub fn validate_pid_start_time(pid: u32, expected_start: chrono::DateTime<chrono::Utc>) -> bool {
    #[cfg(target_os = "linux")]
    {
        let stat_path = format!("/proc/{}/stat", pid);
        if let Ok(stat) = std::fs::read_to_string(&stat_path) {
            // The comm field is in parens and may contain spaces; parse after the last ')'.
            if let Some(close_paren) = stat.rfind(')') {
                let fields: Vec<&str> = stat[close_paren + 2..].split_whitespace().collect();
                // starttime is field 22 overall, index 19 after pid and comm
                if let Some(starttime_jiffies) =
                    fields.get(19).and_then(|s| s.parse::<u64>().ok())
                {
                    let expected_age = chrono::Utc::now().signed_duration_since(expected_start);

                    // Long-lived rows: uptime drift makes the comparison unreliable
                    if expected_age.num_hours() > 24 {
                        return true;
                    }

                    let uptime_secs = std::fs::read_to_string("/proc/uptime")
                        .ok()
                        .and_then(|s| s.split_whitespace().next().map(str::to_string))
                        .and_then(|s| s.parse::<f64>().ok());

                    if let Some(uptime_secs) = uptime_secs {
                        let process_age_secs = uptime_secs
                            - (starttime_jiffies as f64 / get_clock_ticks_per_sec() as f64);
                        let expected_age_secs = expected_age.num_seconds() as f64;

                        if (process_age_secs - expected_age_secs).abs() > 60.0 {
                            tracing::warn!(
                                "PID {} appears to be reused: process age {:.0}s vs expected {:.0}s",
                                pid,
                                process_age_secs,
                                expected_age_secs
                            );
                            return false;
                        }
                    }
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        use chrono::TimeZone;
        if let Ok(output) = std::process::Command::new("ps")
            .args(["-o", "lstart=", "-p", &pid.to_string()])
            .output()
        {
            if output.status.success() {
                let lstart = String::from_utf8_lossy(&output.stdout);
                if let Ok(process_start) =
                    chrono::NaiveDateTime::parse_from_str(lstart.trim(), "%a %b %e %H:%M:%S %Y")
                {
                    // ps reports local time
                    let Some(process_start_utc) = chrono::Local
                        .from_local_datetime(&process_start)
                        .earliest()
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                    else {
                        return true;
                    };
                    if (process_start_utc - expected_start).num_seconds().abs() > 60 {
                        tracing::warn!(
                            "PID {} appears to be reused: process started at {} vs expected {}",
                            pid,
                            process_start_utc,
                            expected_start
                        );
                        return false;
                    }
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn validate_pid_rejects_reserved_values() {
        assert!(validate_pid(0, "svc").is_err());
        assert!(validate_pid(1, "svc").is_err());
        assert!(validate_pid(i32::MAX as u32 + 1, "svc").is_err());
        assert_eq!(validate_pid(4242, "svc").unwrap().as_raw(), 4242);
    }

    #[test]
    fn validate_pid_for_check_allows_init() {
        assert!(validate_pid_for_check(1).is_some());
        assert!(validate_pid_for_check(0).is_none());
        assert!(validate_pid_for_check(u32::MAX).is_none());
    }

    #[test]
    fn matching_start_time_returns_true() {
        // The test binary started moments ago, well within the tolerance window.
        assert!(validate_pid_start_time(std::process::id(), Utc::now()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mismatched_start_time_returns_false() {
        // Claim our own PID started two hours ago: off by far more than 60s.
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        assert!(!validate_pid_start_time(std::process::id(), two_hours_ago));
    }

    #[test]
    fn nonexistent_pid_is_trusted() {
        assert!(validate_pid_start_time(u32::MAX - 1, Utc::now()));
    }

    #[test]
    fn no_recipe_has_suggestion() {
        let err = Error::NoLaunchRecipe {
            name: "agent".into(),
            reason: "snapshot missing".into(),
        };
        assert!(err.with_suggestion().contains("Hint:"));
    }
}
