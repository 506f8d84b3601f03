use std::fmt;
use std::time::Duration;

/// Stderr fragments the docker CLI prints when it cannot reach the daemon.
const DAEMON_UNREACHABLE_MARKERS: [&str; 4] = [
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
    "permission denied while trying to connect",
];

/// Structured error type for container runtime operations.
#[derive(Debug)]
pub enum DockerError {
    /// Docker command timed out.
    Timeout { command: String, timeout: Duration },

    /// Docker command ran but returned non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Docker binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Container doesn't exist (parsed from "No such container" stderr).
    ContainerNotFound { container: String },

    /// Docker daemon not responding.
    DaemonUnavailable,

    /// Output could not be parsed.
    InvalidOutput { command: String, reason: String },
}

impl DockerError {
    /// Create a timeout error.
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        DockerError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Classify a non-zero exit from an `std::process::Output`.
    ///
    /// Daemon connection failures become `DaemonUnavailable` and missing
    /// containers become `ContainerNotFound` when `container` is given.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if DAEMON_UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
            return DockerError::DaemonUnavailable;
        }
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    /// Like [`DockerError::failed`] but maps "No such container/object" to
    /// `ContainerNotFound`.
    pub fn failed_for(
        cmd: impl Into<String>,
        container: &str,
        output: &std::process::Output,
    ) -> Self {
        match Self::failed(cmd, output) {
            DockerError::CommandFailed { stderr, .. }
                if stderr.contains("No such container") || stderr.contains("No such object") =>
            {
                DockerError::ContainerNotFound {
                    container: container.to_string(),
                }
            }
            other => other,
        }
    }

    /// Create an exec-failed error (binary not found / permission denied).
    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        DockerError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn invalid_output(cmd: impl Into<String>, reason: impl Into<String>) -> Self {
        DockerError::InvalidOutput {
            command: cmd.into(),
            reason: reason.into(),
        }
    }

    /// True when the runtime itself could not be reached (binary missing,
    /// daemon down, or no answer in time). Callers degrade to a no-op.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DockerError::Timeout { .. } | DockerError::ExecFailed { .. } | DockerError::DaemonUnavailable
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::ContainerNotFound { .. })
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerError::Timeout { command, timeout } => {
                write!(
                    f,
                    "Timed out running '{}' (exceeded {} seconds)",
                    command,
                    timeout.as_secs()
                )
            }
            DockerError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            DockerError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            DockerError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            DockerError::DaemonUnavailable => {
                write!(f, "Docker daemon is not responding")
            }
            DockerError::InvalidOutput { command, reason } => {
                write!(f, "Unexpected output from '{}': {}", command, reason)
            }
        }
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DockerError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn daemon_down_is_unavailable() {
        let err = DockerError::failed(
            "docker ps",
            &output(
                1,
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            ),
        );
        assert!(matches!(err, DockerError::DaemonUnavailable));
        assert!(err.is_unavailable());
    }

    #[test]
    fn missing_container_is_not_found() {
        let err = DockerError::failed_for(
            "docker rm -f abc",
            "abc",
            &output(1, "Error response from daemon: No such container: abc"),
        );
        assert!(err.is_not_found());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn other_failures_keep_exit_code() {
        let err = DockerError::failed("docker stop x", &output(125, "boom"));
        match err {
            DockerError::CommandFailed { exit_code, .. } => assert_eq!(exit_code, Some(125)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let err = DockerError::exec_failed(
            "docker info",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        assert!(err.is_unavailable());
    }
}
