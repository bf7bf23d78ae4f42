use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use wayfare_core::{EntityType, Resolution};

#[derive(Parser)]
#[command(name = "wayfare")]
#[command(about = "Track travel expenses offline and sync them when you can")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update a trip, destination or expense
    Put {
        /// Entity kind
        #[arg(value_enum)]
        kind: EntityKind,
        /// Entity fields as a JSON object (`-` reads stdin)
        #[arg(long, value_name = "OBJECT")]
        json: String,
    },
    /// Delete an entity
    #[command(alias = "rm")]
    Delete {
        #[arg(value_enum)]
        kind: EntityKind,
        /// Entity ID
        id: String,
    },
    /// Show changes waiting to be pushed
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Talk to the sync backend
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Run one sync cycle now
    Run,
    /// Show cursor, queue size and entity states
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List open conflicts
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle one conflict
    Resolve {
        #[arg(value_enum)]
        kind: EntityKind,
        /// Entity ID
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// Upload the whole local dataset once, before regular sync starts
    Migrate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntityKind {
    Trip,
    Destination,
    Expense,
}

impl From<EntityKind> for EntityType {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Trip => Self::Trip,
            EntityKind::Destination => Self::Destination,
            EntityKind::Expense => Self::Expense,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Server,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::KeepLocal,
            KeepSide::Server => Self::KeepServer,
        }
    }
}
