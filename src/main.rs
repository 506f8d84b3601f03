mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use fleet_manager::Error as FleetError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
            eprintln!("Error: {}", fleet_error);
            if let Some(suggestion) = fleet_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let out = &output::CliOutput;

    // Commands that need the config but no store
    if let Commands::Validate = cli.command {
        return commands::run_validate(cli.config, out);
    }

    let ctx = commands::Context::load(cli.config.clone(), cli.command.mutates_state()).await?;

    match &cli.command {
        Commands::Start { name } => commands::run_start(&ctx, name, out).await?,
        Commands::Stop { name } => commands::run_stop(&ctx, name, out).await?,
        Commands::Restart { name } => commands::run_restart(&ctx, name, out).await?,
        Commands::Status { name, json } => {
            commands::run_status(&ctx, name.as_deref(), *json, out).await?
        }
        Commands::Logs { name, lines } => commands::run_logs(&ctx, name, *lines, out).await?,
        Commands::Daemon => commands::run_daemon(&ctx, out).await?,
        Commands::Host(host_cmd) => commands::run_host(&ctx, host_cmd, out).await?,
        Commands::Container(container_cmd) => {
            commands::run_container(&ctx, container_cmd, out).await?
        }
        Commands::System { json } => commands::run_system(&ctx, *json, out).await?,
        Commands::Validate => unreachable!("handled before the store is opened"),
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
