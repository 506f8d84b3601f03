//! OS process control: detached spawn, signals, liveness and the process table.

use crate::config::CommandSpec;
use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Spawn `spec` detached in its own session with stdout/stderr redirected to
/// the given files (truncated). Returns the OS pid.
///
/// The child is reaped by a background task so a quick exit never lingers as
/// a zombie while the supervisor runs; it keeps running if the supervisor exits.
pub fn spawn_detached(spec: &CommandSpec, stdout_log: &Path, stderr_log: &Path) -> Result<u32> {
    let stdout = File::create(stdout_log)?;
    let stderr = File::create(stderr_log)?;

    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);

    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }

    // SAFETY: the closure runs between fork() and exec() in the child, where
    // only async-signal-safe calls are allowed. setsid() is one; the closure
    // allocates nothing and takes no locks.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        Error::Process(format!("failed to spawn '{}': {}", spec.display_line(), e))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process(format!("'{}' exited before its pid was read", spec.program)))?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::debug!("Process {} exited: {}", pid, status),
            Err(e) => tracing::debug!("Failed to wait for process {}: {}", pid, e),
        }
    });

    Ok(pid)
}

/// Whether `pid` refers to a live, non-zombie process.
///
/// EPERM on the zero signal means the process exists under another user.
pub fn is_alive(pid: u32) -> bool {
    let Some(nix_pid) = validate_pid_for_check(pid) else {
        return false;
    };

    match signal::kill(nix_pid, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Zombie / dead detection. Unknown state counts as alive.
fn is_zombie(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if let Some(state) = line.strip_prefix("State:") {
                    // Z zombie, X/x dead
                    return matches!(state.trim().chars().next(), Some('Z' | 'X' | 'x'));
                }
            }
        }
        false
    }

    #[cfg(not(target_os = "linux"))]
    {
        match std::process::Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "stat="])
            .output()
        {
            Ok(output) => {
                let stat = String::from_utf8_lossy(&output.stdout);
                let stat = stat.trim();
                stat.is_empty() || stat.starts_with('Z')
            }
            Err(_) => false,
        }
    }
}

/// Process group to signal for `pid`: only when `pid` leads its own group,
/// and never our own group.
fn signal_group_for(pid: Pid) -> Option<Pid> {
    let pgid = getpgid(Some(pid)).ok()?;
    let own = getpgid(None).ok();
    (pgid == pid && Some(pgid) != own).then_some(pgid)
}

/// Send `sig` to the process group led by `pid`, falling back to the pid.
fn send(pid: Pid, sig: Signal) -> std::result::Result<(), Errno> {
    if let Some(pgid) = signal_group_for(pid) {
        if signal::killpg(pgid, sig).is_ok() {
            return Ok(());
        }
    }
    signal::kill(pid, sig)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace window.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// No such process, or not ours to signal.
    NotRunning,
}

/// SIGTERM, poll for `grace`, then SIGKILL.
///
/// ESRCH and EPERM both mean there is nothing for us to stop.
pub async fn terminate(pid: u32, grace: Duration, service_name: &str) -> Result<Termination> {
    let nix_pid = validate_pid(pid, service_name)?;

    if !is_alive(pid) {
        return Ok(Termination::NotRunning);
    }

    match send(nix_pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) | Err(Errno::EPERM) => return Ok(Termination::NotRunning),
        Err(e) => {
            return Err(Error::Process(format!(
                "failed to signal PID {} for '{}': {}",
                pid, service_name, e
            )))
        }
    }

    let polls = (grace.as_millis() / POLL_INTERVAL.as_millis()).max(1);
    for _ in 0..polls {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !is_alive(pid) {
            return Ok(Termination::Terminated);
        }
    }

    tracing::warn!(
        "Process {} for '{}' did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
        pid,
        service_name,
        grace
    );
    match send(nix_pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(Termination::Terminated),
        Err(e) => {
            return Err(Error::Process(format!(
                "failed to kill PID {} for '{}': {}",
                pid, service_name, e
            )))
        }
    }

    let deadline = tokio::time::Instant::now() + KILL_SETTLE;
    while is_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(Termination::Killed)
}

/// One entry of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub cmdline: String,
}

/// Every process with a readable command line.
pub fn list_processes() -> Vec<ProcessInfo> {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
                let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
                if raw.is_empty() {
                    // kernel thread or zombie
                    return None;
                }
                let cmdline = raw
                    .split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ");
                let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
                // ppid is the second field after the parenthesised comm
                let after_comm = &stat[stat.rfind(')')? + 1..];
                let ppid = after_comm.split_whitespace().nth(1)?.parse().ok()?;
                Some(ProcessInfo { pid, ppid, cmdline })
            })
            .collect()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let Ok(output) = std::process::Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()
        else {
            return Vec::new();
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let cmdline = parts.collect::<Vec<_>>().join(" ");
                (!cmdline.is_empty()).then_some(ProcessInfo { pid, ppid, cmdline })
            })
            .collect()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Whole-word occurrence of `name` in `cmdline`: neighbours must not be
/// alphanumeric, `-` or `_` (so `ssh-agent` does not match `agent`).
pub fn cmdline_mentions(cmdline: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    cmdline.match_indices(name).any(|(start, _)| {
        let before = cmdline[..start].chars().next_back();
        let after = cmdline[start + name.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

/// Processes whose command line references `service_name`, excluding this
/// process, its parent and anything in `exclude`.
pub fn find_orphans(service_name: &str, exclude: &[u32]) -> Vec<ProcessInfo> {
    let own = std::process::id();
    let parent = std::os::unix::process::parent_id();
    list_processes()
        .into_iter()
        .filter(|p| p.pid != own && p.pid != parent && p.pid > 1 && !exclude.contains(&p.pid))
        .filter(|p| cmdline_mentions(&p.cmdline, service_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_word_matching() {
        assert!(cmdline_mentions("python -m agent --port 9", "agent"));
        assert!(cmdline_mentions("/opt/bin/agent", "agent"));
        assert!(cmdline_mentions("run infra-api", "infra-api"));
        assert!(!cmdline_mentions("ssh-agent -s", "agent"));
        assert!(!cmdline_mentions("agent_runner", "agent"));
        assert!(!cmdline_mentions("infra-api-v2 serve", "infra-api"));
        assert!(!cmdline_mentions("anything", ""));
        // second occurrence can still match
        assert!(cmdline_mentions("ssh-agent agent", "agent"));
    }

    #[test]
    fn own_process_is_alive_and_listed() {
        assert!(is_alive(std::process::id()));
        let me = std::process::id();
        assert!(list_processes().iter().any(|p| p.pid == me));
    }

    #[test]
    fn invalid_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn orphan_scan_never_returns_self() {
        let me = std::process::id();
        // The test binary's own command line is excluded even if it matches
        let exe = std::env::args().next().unwrap_or_default();
        let word = exe.rsplit('/').next().unwrap_or_default().to_string();
        assert!(find_orphans(&word, &[]).iter().all(|p| p.pid != me));
    }

    #[tokio::test]
    async fn spawn_and_terminate_sleep() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::new(crate::state::ServiceType::Agent, "sleep").arg("300");
        let pid = spawn_detached(
            &spec,
            &dir.path().join("out.log"),
            &dir.path().join("err.log"),
        )
        .unwrap();
        assert!(is_alive(pid));

        // Its own session leader, so its group is signalled
        assert_eq!(
            getpgid(Some(Pid::from_raw(pid as i32))).unwrap().as_raw(),
            pid as i32
        );

        let outcome = terminate(pid, Duration::from_secs(2), "sleeper").await.unwrap();
        assert_eq!(outcome, Termination::Terminated);

        // Give the reaper task a moment
        for _ in 0..20 {
            if !is_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_alive(pid));
        assert_eq!(
            terminate(pid, Duration::from_millis(100), "sleeper").await.unwrap(),
            Termination::NotRunning
        );
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::new(crate::state::ServiceType::Agent, "/nonexistent/binary-xyz");
        let result = spawn_detached(
            &spec,
            &dir.path().join("out.log"),
            &dir.path().join("err.log"),
        );
        assert!(matches!(result, Err(Error::Process(_))));
    }
}
