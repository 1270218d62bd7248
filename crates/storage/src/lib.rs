mod decode;
pub mod dynamodb_store;
pub mod exclusions;
pub mod index;
pub mod migration;
pub mod offline_store;
pub mod sqlite_store;
pub mod store;
pub mod table;

use std::fmt;
use std::str::FromStr;

use borgboi_core::{Config, Result, StorageError};
use tracing::info;

pub use dynamodb_store::{AwsRepoTable, DynamoDbStore};
pub use exclusions::ExclusionStore;
pub use migration::{MigrationReport, MigrationResult};
pub use offline_store::OfflineStore;
pub use sqlite_store::SqliteStore;
pub use store::{RepositoryStorage, S3StatsStore};
pub use table::{MemoryRepoTable, RepoTable};

/// Which backend holds repository metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// JSON files under `<borgboi_dir>/data`.
    Offline,
    /// `<borgboi_dir>/.database/borgboi.db`.
    Sqlite,
    /// The shared DynamoDB table.
    DynamoDb,
}

impl BackendKind {
    /// Offline mode keeps metadata in the local database; online mode uses the shared table.
    pub fn from_config(config: &Config) -> Self {
        if config.offline {
            Self::Sqlite
        } else {
            Self::DynamoDb
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Sqlite => "sqlite",
            Self::DynamoDb => "dynamodb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "offline" | "json" => Ok(Self::Offline),
            "sqlite" => Ok(Self::Sqlite),
            "dynamodb" | "dynamo" => Ok(Self::DynamoDb),
            other => Err(StorageError::InvalidArgument(format!(
                "unknown storage backend '{other}' (expected offline, sqlite or dynamodb)"
            ))),
        }
    }
}

/// Constructs the requested backend. Local backends run their legacy migration here.
pub fn open_storage(config: &Config, kind: BackendKind) -> Result<Box<dyn RepositoryStorage>> {
    info!(backend = %kind, "opening repository storage");
    Ok(match kind {
        BackendKind::Offline => Box::new(OfflineStore::from_config(config)?),
        BackendKind::Sqlite => Box::new(SqliteStore::from_config(config)?),
        BackendKind::DynamoDb => Box::new(DynamoDbStore::from_config(config)?),
    })
}
