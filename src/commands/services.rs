use super::Context;
use crate::output::UserOutput;
use fleet_manager::supervisor::actor;
use fleet_manager::{Error, ManagedService, ServiceStatus, SyncOutcome};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long `daemon` waits for the supervisor task on Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run_start(ctx: &Context, name: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    let recipe = ctx.config.services.get(name).ok_or_else(|| Error::NoLaunchRecipe {
        name: name.to_string(),
        reason: "not configured".to_string(),
    })?;
    let spec = recipe.to_command_spec(&ctx.base_dir);
    let snapshot = serde_json::to_value(recipe)?;

    let supervisor = ctx.supervisor();
    if supervisor.start(name, spec, snapshot).await {
        out.success(&format!("Service '{}' started", name));
        Ok(())
    } else {
        report_failure(ctx, name, "start", out).await
    }
}

pub async fn run_stop(ctx: &Context, name: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    if ctx.supervisor().stop(name).await {
        out.success(&format!("Service '{}' stopped", name));
        Ok(())
    } else {
        anyhow::bail!("failed to stop service '{}'", name)
    }
}

pub async fn run_restart(ctx: &Context, name: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    if ctx.supervisor().restart(name).await? {
        out.success(&format!("Service '{}' restarted", name));
        Ok(())
    } else {
        report_failure(ctx, name, "restart", out).await
    }
}

async fn report_failure(
    ctx: &Context,
    name: &str,
    action: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    if let Some(row) = ctx.supervisor().status(name).await? {
        if let Some(last_error) = row.last_error {
            out.error(&last_error);
        }
    }
    anyhow::bail!("service '{}' failed to {}", name, action)
}

pub async fn run_status(
    ctx: &Context,
    name: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor();
    let services = match name {
        Some(name) => match supervisor.status(name).await? {
            Some(row) => vec![row],
            None => return Err(Error::ServiceNotFound(name.to_string()).into()),
        },
        None => supervisor.list_services().await?,
    };

    if json {
        out.status(&serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    out.status("Service Status:");
    out.status(&format!("{:-<60}", ""));
    if services.is_empty() {
        out.status("  No services recorded");
    }
    for service in &services {
        out.status(&status_line(service));
    }
    Ok(())
}

fn status_line(service: &ManagedService) -> String {
    let icon = match service.status {
        ServiceStatus::Running => "+",
        ServiceStatus::Starting => ".",
        ServiceStatus::Stopped => "o",
        ServiceStatus::Error => "x",
    };
    let pid = service
        .pid
        .map(|p| format!("pid {}", p))
        .unwrap_or_default();
    let mut line = format!(
        "  {} {:<24} {:<12} {:<8} {:<10}",
        icon,
        service.name,
        service.service_type.as_str(),
        service.status.as_str(),
        pid
    );
    if service.error_count > 0 {
        line.push_str(&format!(" errors: {}", service.error_count));
    }
    line
}

pub async fn run_logs(
    ctx: &Context,
    name: &str,
    lines: usize,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let tail = ctx.supervisor().log_tail(name, lines)?;
    out.status(&format!("==> {} stdout <==", name));
    for line in &tail.stdout {
        out.status(line);
    }
    out.status(&format!("==> {} stderr <==", name));
    for line in &tail.stderr {
        out.status(line);
    }
    Ok(())
}

/// Heartbeat through the supervisor actor and periodic container sync, until Ctrl-C.
pub async fn run_daemon(ctx: &Context, out: &dyn UserOutput) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let heartbeat = ctx.config.supervisor.heartbeat_interval();
    let (handle, task) = actor::spawn(ctx.supervisor(), heartbeat, cancel.child_token());

    let reconciler = ctx.reconciler();
    match reconciler.register_local_host().await {
        Ok(host) => out.status(&format!("Registered host '{}' ({})", host.name, host.id)),
        Err(e) => out.warning(&format!("Host registration failed: {}", e)),
    }

    let sync_every = ctx.config.runtime.sync_interval();
    out.status(&format!(
        "Supervising {} service(s); heartbeat every {:?}, container sync every {:?}. Press Ctrl+C to stop.",
        handle.list_services().await?.len(),
        heartbeat,
        sync_every
    ));

    let mut sync_interval = tokio::time::interval(sync_every);
    let mut runtime_was_up = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                out.status("Shutting down...");
                break;
            }
            _ = sync_interval.tick() => {
                match reconciler.sync_containers().await {
                    Ok(SyncOutcome::Synced(_)) => runtime_was_up = true,
                    Ok(SyncOutcome::RuntimeUnavailable) => {
                        if runtime_was_up {
                            out.warning("Container runtime unavailable, container sync paused");
                        }
                        runtime_was_up = false;
                    }
                    Err(e) => tracing::warn!("Container sync failed: {}", e),
                }
            }
        }
    }

    cancel.cancel();
    task.shutdown(SHUTDOWN_TIMEOUT).await?;
    Ok(())
}
