use std::path::Path;

use serde::Serialize;
use wayfare_core::sync::{ConflictResolver, CycleOutcome, CycleReport, SyncTrigger};
use wayfare_core::util::{format_timestamp, now};
use wayfare_core::{EntityType, Resolution};

use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_optional_timestamp, normalize_entity_id,
    open_database, open_sync_controller, ConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let controller = open_sync_controller(db_path).await?;

    match controller.request(SyncTrigger::Manual).await? {
        CycleOutcome::Completed(report) => {
            for line in format_cycle_report(&report) {
                println!("{line}");
            }
        }
        CycleOutcome::Coalesced => println!("A sync is already running; it will pick this up."),
        CycleOutcome::Skipped => println!("Nothing to sync."),
        CycleOutcome::Offline => println!("Offline; changes stay queued."),
        CycleOutcome::BackingOff { retry_in } => {
            println!("Backing off; next attempt in {}s", retry_in.as_secs());
        }
    }
    Ok(())
}

pub fn format_cycle_report(report: &CycleReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync completed: pushed {}, applied {}, conflicts {}, errors {}",
        report.pushed, report.applied, report.conflicts, report.errored
    )];
    if report.server_changes_applied > 0 || report.server_changes_deferred > 0 {
        lines.push(format!(
            "Pulled {} server changes ({} deferred behind local edits)",
            report.server_changes_applied, report.server_changes_deferred
        ));
    }
    if report.conflicts > 0 {
        lines.push("Run `wayfare sync conflicts` to review.".to_string());
    }
    lines
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub last_synced_at: Option<String>,
    pub migrated_at: Option<String>,
    pub queued: usize,
    pub open_conflicts: usize,
    pub statuses: Vec<StatusCount>,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: u64,
}

pub async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let cursor = db.cursor().await?;
    let migrated_at = db.migrated_at().await?;

    let report = StatusReport {
        last_synced_at: cursor.as_ref().map(format_timestamp),
        migrated_at: migrated_at.as_ref().map(format_timestamp),
        queued: db.queue_entries().await?.len(),
        open_conflicts: db.conflicts().await?.len(),
        statuses: db
            .status_counts()
            .await?
            .into_iter()
            .map(|(status, count)| StatusCount {
                status: status.to_string(),
                count,
            })
            .collect(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Last synced: {}", format_optional_timestamp(cursor.as_ref()));
    println!("Migrated:    {}", format_optional_timestamp(migrated_at.as_ref()));
    println!("Queued:      {}", report.queued);
    println!("Conflicts:   {}", report.open_conflicts);
    for entry in &report.statuses {
        println!("  {:<8} {}", entry.status, entry.count);
    }
    Ok(())
}

pub async fn run_sync_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let conflicts = ConflictResolver::new(db).list().await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Result<Vec<ConflictItem>, _>>()?;
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_resolve(
    entity_type: EntityType,
    id: &str,
    resolution: Resolution,
    db_path: &Path,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let db = open_database(db_path).await?;
    let resolver = ConflictResolver::new(db);

    if resolver.get(entity_type, &id).await?.is_none() {
        return Err(CliError::ConflictNotFound(format!("{entity_type} {id}")));
    }
    resolver.resolve(entity_type, &id, resolution, now()).await?;

    println!("Resolved {entity_type} {id} ({resolution}); the server hears about it on the next sync");
    Ok(())
}

pub async fn run_sync_migrate(db_path: &Path) -> Result<(), CliError> {
    let controller = open_sync_controller(db_path).await?;
    let report = controller.import_local_dataset().await?;

    println!("{}", report.message);
    println!(
        "Imported trips {}, destinations {}, expenses {}",
        report.imported.trips, report.imported.destinations, report.imported.expenses
    );
    if !report.conflicts.is_empty() {
        println!(
            "{} conflicts; run `wayfare sync conflicts` to review.",
            report.conflicts.len()
        );
    }
    Ok(())
}
