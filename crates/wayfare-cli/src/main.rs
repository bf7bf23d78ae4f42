//! Wayfare CLI - record travel expenses offline and sync them later

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::delete::run_delete;
use crate::commands::put::run_put;
use crate::commands::queue::run_queue;
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_migrate, run_sync_resolve, run_sync_status,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        if let Some(hint) = error.hint() {
            eprintln!("{hint}");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wayfare=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Put { kind, json } => run_put(kind.into(), &json, &db_path).await?,
        Commands::Delete { kind, id } => run_delete(kind.into(), &id, &db_path).await?,
        Commands::Queue { json } => run_queue(json, &db_path).await?,
        Commands::Sync { command } => match command {
            SyncCommands::Run => run_sync(&db_path).await?,
            SyncCommands::Status { json } => run_sync_status(json, &db_path).await?,
            SyncCommands::Conflicts { json } => run_sync_conflicts(json, &db_path).await?,
            SyncCommands::Resolve { kind, id, keep } => {
                run_sync_resolve(kind.into(), &id, keep.into(), &db_path).await?;
            }
            SyncCommands::Migrate => run_sync_migrate(&db_path).await?,
        },
    }

    Ok(())
}
