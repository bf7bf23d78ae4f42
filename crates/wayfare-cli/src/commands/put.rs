use std::path::Path;

use wayfare_core::queue::QueueWrite;
use wayfare_core::util::now;
use wayfare_core::EntityType;

use crate::commands::common::{open_database, parse_entity_json, resolve_json_input};
use crate::error::CliError;

pub async fn run_put(entity_type: EntityType, json: &str, db_path: &Path) -> Result<(), CliError> {
    let raw = resolve_json_input(json)?;
    let timestamp = now();
    let record = parse_entity_json(entity_type, &raw, timestamp)?;

    let db = open_database(db_path).await?;
    let write = db.save(&record, timestamp).await?;
    tracing::debug!(entity_type = %entity_type, ?write, "Saved entity");

    println!("{}", record.id());
    if write == QueueWrite::Keep {
        println!("(a newer queued change already covers this entity)");
    }
    Ok(())
}
