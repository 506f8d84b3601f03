//! Periodic liveness sweep over the registry.

use super::{os, ProcessSupervisor};
use crate::error::Result;
use crate::state::ServiceStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Live rows examined.
    pub checked: usize,
    /// Rows whose process is alive.
    pub alive: usize,
    /// Rows transitioned to stopped because their process is gone.
    pub marked_stopped: usize,
    /// Terminal rows removed by the stale-record purge.
    pub purged: usize,
}

impl ProcessSupervisor {
    /// Verify every `running` (and lingering `starting`) row against the OS.
    ///
    /// Alive rows get `last_heartbeat` advanced; dead rows become `stopped`.
    /// Both writes are conditional on the pid observed here. When a stale
    /// record age is configured, old terminal rows are purged afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn heartbeat_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let mut rows = self.registry.list_by_status(ServiceStatus::Running).await?;
        rows.extend(self.registry.list_by_status(ServiceStatus::Starting).await?);

        for row in rows {
            report.checked += 1;
            let Some(pid) = row.pid else {
                // Unreachable under the pid/status constraint, heal anyway
                if self.registry.mark_stopped(&row.name).await? {
                    report.marked_stopped += 1;
                }
                continue;
            };

            if self.pid_matches_row(pid, &row) {
                report.alive += 1;
                if row.status == ServiceStatus::Running {
                    self.registry.touch_heartbeat(&row.name, pid).await?;
                }
                continue;
            }

            // A `starting` row with a live pid is mid-settle; only dead ones get here
            if self.registry.mark_dead_if_pid(&row.name, pid).await? {
                info!(
                    "Service '{}' (PID {}) is no longer running, marked stopped",
                    row.name, pid
                );
                report.marked_stopped += 1;
                if let Err(e) = self.files.remove_pid(&row.name) {
                    warn!("Failed to remove pid file for '{}': {}", row.name, e);
                }
            }
        }

        if let Some(age) = self.options.stale_record_age {
            report.purged = self.registry.purge_stale(age).await?;
        }

        debug!(
            checked = report.checked,
            alive = report.alive,
            marked_stopped = report.marked_stopped,
            purged = report.purged,
            "Heartbeat sweep complete"
        );
        Ok(report)
    }

    /// `pid` is alive and, when the row records a start time, still the same process.
    pub(crate) fn pid_matches_row(&self, pid: u32, row: &crate::state::ManagedService) -> bool {
        if !os::is_alive(pid) {
            return false;
        }
        match row.started_at {
            Some(started_at) => crate::error::validate_pid_start_time(pid, started_at),
            None => true,
        }
    }
}
