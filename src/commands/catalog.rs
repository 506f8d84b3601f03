use super::Context;
use crate::cli::{ContainerCommands, HostCommands};
use crate::output::UserOutput;
use fleet_manager::state::{Host, ManagedContainer};
use fleet_manager::SyncOutcome;

pub async fn run_host(ctx: &Context, cmd: &HostCommands, out: &dyn UserOutput) -> anyhow::Result<()> {
    let reconciler = ctx.reconciler();
    match cmd {
        HostCommands::List { json } => {
            let hosts = reconciler.list_hosts().await?;
            if *json {
                out.status(&serde_json::to_string_pretty(&hosts)?);
            } else if hosts.is_empty() {
                out.status("No hosts registered");
            } else {
                for host in &hosts {
                    out.status(&host_line(host));
                }
            }
        }
        HostCommands::Add { name, ip, tag } => {
            let host = reconciler.add_host(name, ip, tag.clone()).await?;
            out.success(&format!("Host '{}' ({}) at {}", host.name, host.id, host.ip));
        }
        HostCommands::Register => {
            let host = reconciler.register_local_host().await?;
            out.success(&format!("Registered '{}' as {}", host.name, host.id));
        }
        HostCommands::Dedupe => {
            let report = reconciler.dedupe_hosts().await?;
            if report.removed == 0 {
                out.status("No duplicate hosts");
            } else {
                out.success(&format!(
                    "Merged {} duplicate host(s) across {} IP(s)",
                    report.removed, report.groups
                ));
            }
        }
        HostCommands::Rm { id } => {
            reconciler.delete_host(id).await?;
            out.success(&format!("Removed host {}", id));
        }
    }
    Ok(())
}

fn host_line(host: &Host) -> String {
    let seen = host
        .last_seen
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let mut line = format!(
        "  {:<36} {:<20} {:<16} {:<12} {}",
        host.id,
        host.name,
        host.ip,
        host.status.as_str(),
        seen
    );
    if !host.tags.is_empty() {
        line.push_str(&format!(" [{}]", host.tags.join(", ")));
    }
    line
}

pub async fn run_container(
    ctx: &Context,
    cmd: &ContainerCommands,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let reconciler = ctx.reconciler();
    match cmd {
        ContainerCommands::List { host, json } => {
            let containers = reconciler.list_containers(host.as_deref()).await?;
            if *json {
                out.status(&serde_json::to_string_pretty(&containers)?);
            } else if containers.is_empty() {
                out.status("No containers in catalog (run `fleet container sync`)");
            } else {
                for container in &containers {
                    out.status(&container_line(container));
                }
            }
        }
        ContainerCommands::Sync => {
            report_sync(reconciler.sync_containers().await?, out);
        }
        ContainerCommands::Start { id } => {
            report_sync(reconciler.start_container(id).await?, out);
            out.success(&format!("Started container {}", id));
        }
        ContainerCommands::Stop { id } => {
            report_sync(reconciler.stop_container(id).await?, out);
            out.success(&format!("Stopped container {}", id));
        }
        ContainerCommands::Rm { id } => {
            reconciler.remove_container(id).await?;
            out.success(&format!("Removed container {}", id));
        }
        ContainerCommands::Exec { id, cmd } => {
            let output = reconciler.exec_in_container(id, cmd).await?;
            if !output.stdout.is_empty() {
                out.status(output.stdout.trim_end());
            }
            if !output.stderr.is_empty() {
                out.warning(output.stderr.trim_end());
            }
            if !output.success() {
                anyhow::bail!(
                    "command exited with {}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                );
            }
        }
        ContainerCommands::Logs { id, tail } => {
            let logs = reconciler.get_container_logs(id, *tail).await?;
            out.status(logs.trim_end());
        }
    }
    Ok(())
}

fn report_sync(outcome: SyncOutcome, out: &dyn UserOutput) {
    match outcome {
        SyncOutcome::Synced(report) => out.status(&format!(
            "Synced: {} new, {} updated, {} removed ({} of {} containers running)",
            report.inserted,
            report.updated,
            report.deleted,
            report.system.running_containers,
            report.system.total_containers
        )),
        SyncOutcome::RuntimeUnavailable => {
            out.warning("Container runtime unavailable, catalog left unchanged")
        }
    }
}

fn container_line(c: &ManagedContainer) -> String {
    let short_id: String = c.id.chars().take(12).collect();
    format!(
        "  {:<12} {:<24} {:<30} {:<10} {}",
        short_id,
        c.name,
        c.image,
        c.status.as_str(),
        c.host_id
    )
}

pub async fn run_system(ctx: &Context, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let status = ctx.reconciler().system_status().await?;
    if json {
        out.status(&serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    out.status("Fleet Status:");
    out.status(&format!("{:-<40}", ""));
    out.status(&format!(
        "  Hosts:      {} online / {} total",
        status.online_hosts, status.total_hosts
    ));
    out.status(&format!(
        "  Containers: {} running / {} total",
        status.running_containers, status.total_containers
    ));
    out.status(&format!(
        "  Services:   {} running / {} total",
        status.running_services, status.total_services
    ));
    if let Some(updated) = status.updated_at {
        out.status(&format!("  Updated:    {}", updated.format("%Y-%m-%d %H:%M:%S")));
    }
    Ok(())
}
