use std::path::Path;

use wayfare_core::queue::QueueWrite;
use wayfare_core::util::now;
use wayfare_core::EntityType;

use crate::commands::common::{normalize_entity_id, open_database};
use crate::error::CliError;

pub async fn run_delete(entity_type: EntityType, id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;

    let db = open_database(db_path).await?;
    match db.delete(entity_type, &id, now()).await? {
        QueueWrite::Remove => println!("Deleted {entity_type} {id} (never synced)"),
        _ => println!("Deleted {entity_type} {id}"),
    }
    Ok(())
}
