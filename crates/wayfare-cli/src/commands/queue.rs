use std::path::Path;

use crate::commands::common::{format_queue_lines, open_database, queue_entry_to_item, QueueItem};
use crate::error::CliError;

pub async fn run_queue(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let entries = db.queue_entries().await?;

    if as_json {
        let json_items = entries
            .iter()
            .map(queue_entry_to_item)
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Nothing waiting to sync.");
        return Ok(());
    }

    for line in format_queue_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}
