use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use borgboi_core::{timestamp, Config, RepoMetadata, Repository, Result, RetentionPolicy, S3RepoStats, StorageError};
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::exclusions::ExclusionStore;
use crate::migration::{auto_migrate_sqlite, MigrationReport};
use crate::store::{pick_path_match, RepositoryStorage, S3StatsStore};

pub const SCHEMA_VERSION: i64 = 1;

const REPO_COLUMNS: &str = "name, path, backup_target, hostname, os_platform, last_backup, last_s3_sync,
     created_at, metadata_json, retention_keep_daily, retention_keep_weekly, retention_keep_monthly,
     retention_keep_yearly, passphrase, passphrase_file_path, passphrase_migrated";

/// SQLite-backed repository store. Each method opens a fresh connection; WAL mode lets
/// readers proceed while a write is in flight.
pub struct SqliteStore {
    db_path: PathBuf,
    exclusions: ExclusionStore,
    migration: Option<MigrationReport>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `db_path`.
    ///
    /// When the file does not exist yet and `borgboi_dir` is given, legacy data found
    /// there is migrated before the store is returned.
    pub fn open(db_path: impl Into<PathBuf>, borgboi_dir: Option<&Path>) -> Result<Self> {
        let db_path = db_path.into();
        let fresh = !db_path.exists();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::with_source("init", format!("create {}", parent.display()), e)
            })?;
        }

        let exclusions_dir = match borgboi_dir {
            Some(dir) => dir.join("data").join("exclusions"),
            None => db_path
                .parent()
                .map(|p| p.join("exclusions"))
                .unwrap_or_else(|| PathBuf::from("exclusions")),
        };
        let mut store = Self {
            db_path,
            exclusions: ExclusionStore::new(exclusions_dir),
            migration: None,
        };
        store.init_db()?;

        if let (true, Some(dir)) = (fresh, borgboi_dir) {
            store.migration = Some(auto_migrate_sqlite(&store, dir));
        }
        Ok(store)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(config.database_path(), Some(&config.borgboi_dir()))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn exclusions(&self) -> &ExclusionStore {
        &self.exclusions
    }

    /// Report of the legacy migration run when the database was created, if one ran.
    pub fn last_migration(&self) -> Option<&MigrationReport> {
        self.migration.as_ref()
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.connect()?;
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .map_err(|e| StorageError::with_source("schema_version", "query schema version", e))
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            StorageError::with_source("connect", format!("open {}", self.db_path.display()), e)
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .and_then(|()| conn.pragma_update(None, "foreign_keys", "ON"))
            .map_err(|e| StorageError::with_source("connect", "configure connection", e))?;
        Ok(conn)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.connect()?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StorageError::with_source("init", "enable WAL", e))?;
        debug!(journal_mode = %mode, db = %self.db_path.display(), "opened repository database");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                backup_target TEXT NOT NULL,
                hostname TEXT NOT NULL,
                os_platform TEXT NOT NULL,
                last_backup TEXT,
                last_s3_sync TEXT,
                created_at TEXT,
                metadata_json TEXT,
                retention_keep_daily INTEGER,
                retention_keep_weekly INTEGER,
                retention_keep_monthly INTEGER,
                retention_keep_yearly INTEGER,
                passphrase TEXT,
                passphrase_file_path TEXT,
                passphrase_migrated INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (path, hostname)
            );
            CREATE TABLE IF NOT EXISTS s3_stats_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_name TEXT NOT NULL UNIQUE,
                total_size_bytes INTEGER NOT NULL DEFAULT 0,
                object_count INTEGER NOT NULL DEFAULT 0,
                last_modified TEXT,
                cached_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .map_err(|e| StorageError::with_source("init", "create tables", e))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, timestamp::format(&Utc::now())],
        )
        .map_err(|e| StorageError::with_source("init", "record schema version", e))?;
        Ok(())
    }
}

impl RepositoryStorage for SqliteStore {
    fn get(&self, name: &str) -> Result<Repository> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repositories WHERE name = ?1"),
                [name],
                RepoRow::read,
            )
            .optional()
            .map_err(|e| StorageError::with_source("get", format!("query repository '{name}'"), e))?;
        match row {
            Some(row) => row.into_repository(),
            None => Err(StorageError::not_found_name(name)),
        }
    }

    fn get_by_path(&self, path: &str, hostname: Option<&str>) -> Result<Repository> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {REPO_COLUMNS} FROM repositories WHERE path = ?1"))
            .map_err(|e| StorageError::with_source("get_by_path", "prepare query", e))?;
        let rows = stmt
            .query_map([path], RepoRow::read)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| StorageError::with_source("get_by_path", format!("query path '{path}'"), e))?;

        let matches = rows
            .into_iter()
            .map(RepoRow::into_repository)
            .collect::<Result<Vec<_>>>()?;
        pick_path_match(path, hostname, matches)
    }

    fn list_all(&self) -> Result<Vec<Repository>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {REPO_COLUMNS} FROM repositories ORDER BY name"))
            .map_err(|e| StorageError::with_source("list_all", "prepare query", e))?;
        let rows = stmt
            .query_map([], RepoRow::read)
            .map_err(|e| StorageError::with_source("list_all", "query repositories", e))?;

        let mut repos = Vec::new();
        for row in rows {
            match row.map_err(|e| StorageError::with_source("list_all", "read row", e)) {
                Ok(row) => match row.into_repository() {
                    Ok(repo) => repos.push(repo),
                    Err(e) => warn!(error = %e, "skipping unreadable repository row"),
                },
                Err(e) => warn!(error = %e, "skipping unreadable repository row"),
            }
        }
        Ok(repos)
    }

    fn save(&self, repo: &Repository) -> Result<()> {
        repo.validate()?;
        let metadata_json = repo
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::with_source("save", "serialize metadata", e))?;
        let retention = repo.retention_policy;

        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::with_source("save", "begin transaction", e))?;

        let conflict: Option<String> = tx
            .query_row(
                "SELECT name FROM repositories WHERE path = ?1 AND hostname = ?2 AND name != ?3",
                params![repo.path, repo.hostname, repo.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::with_source("save", "check path uniqueness", e))?;
        if let Some(other) = conflict {
            return Err(StorageError::invalid_field(
                "path",
                format!(
                    "path '{}' on host '{}' is already registered as '{other}'",
                    repo.path, repo.hostname
                ),
            ));
        }

        let existing: Option<i64> = tx
            .query_row("SELECT id FROM repositories WHERE name = ?1", [&repo.name], |row| row.get(0))
            .optional()
            .map_err(|e| StorageError::with_source("save", "look up existing row", e))?;

        let sql = match existing {
            Some(_) => "UPDATE repositories SET path = ?2, backup_target = ?3, hostname = ?4, os_platform = ?5,
                 last_backup = ?6, last_s3_sync = ?7, created_at = ?8, metadata_json = ?9,
                 retention_keep_daily = ?10, retention_keep_weekly = ?11, retention_keep_monthly = ?12,
                 retention_keep_yearly = ?13, passphrase = ?14, passphrase_file_path = ?15,
                 passphrase_migrated = ?16, updated_at = ?17
                 WHERE name = ?1"
                .to_owned(),
            None => format!(
                "INSERT INTO repositories ({REPO_COLUMNS}, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
        };
        let last_backup = repo.last_backup.as_ref().map(timestamp::format);
        let last_s3_sync = repo.last_s3_sync.as_ref().map(timestamp::format);
        let created_at = repo.created_at.as_ref().map(timestamp::format);
        let updated_at = timestamp::format(&Utc::now());
        let written = tx.execute(
            &sql,
            params![
                repo.name,
                repo.path,
                repo.backup_target,
                repo.hostname,
                repo.os_platform.as_str(),
                last_backup,
                last_s3_sync,
                created_at,
                metadata_json,
                retention.map(|r| r.keep_daily),
                retention.map(|r| r.keep_weekly),
                retention.map(|r| r.keep_monthly),
                retention.map(|r| r.keep_yearly),
                repo.passphrase,
                repo.passphrase_file_path,
                repo.passphrase_migrated,
                updated_at,
            ],
        );
        written.map_err(|e| write_error("save", e))?;
        tx.commit().map_err(|e| write_error("save", e))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::with_source("delete", "begin transaction", e))?;
        let removed = tx
            .execute("DELETE FROM repositories WHERE name = ?1", [name])
            .map_err(|e| write_error("delete", e))?;
        if removed == 0 {
            return Err(StorageError::not_found_name(name));
        }
        tx.execute("DELETE FROM s3_stats_cache WHERE repo_name = ?1", [name])
            .map_err(|e| write_error("delete", e))?;
        tx.commit().map_err(|e| write_error("delete", e))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM repositories WHERE name = ?1)",
            [name],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::with_source("exists", format!("query repository '{name}'"), e))
    }
}

impl S3StatsStore for SqliteStore {
    fn get_s3_stats(&self, name: &str) -> Result<Option<S3RepoStats>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT total_size_bytes, object_count, last_modified, cached_at
             FROM s3_stats_cache WHERE repo_name = ?1",
            [name],
            |row| {
                let size: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                let last_modified: Option<String> = row.get(2)?;
                let cached_at: String = row.get(3)?;
                Ok(S3RepoStats {
                    total_size_bytes: u64::try_from(size).unwrap_or(0),
                    object_count: u64::try_from(count).unwrap_or(0),
                    last_modified: last_modified.as_deref().and_then(timestamp::parse),
                    cached_at: timestamp::parse(&cached_at).unwrap_or_else(Utc::now),
                })
            },
        )
        .optional()
        .map_err(|e| StorageError::with_source("get_s3_stats", format!("query stats for '{name}'"), e))
    }

    fn put_s3_stats(&self, name: &str, stats: &S3RepoStats) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO s3_stats_cache (repo_name, total_size_bytes, object_count, last_modified, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(repo_name) DO UPDATE SET
                total_size_bytes = excluded.total_size_bytes,
                object_count = excluded.object_count,
                last_modified = excluded.last_modified,
                cached_at = excluded.cached_at",
            params![
                name,
                i64::try_from(stats.total_size_bytes).unwrap_or(i64::MAX),
                i64::try_from(stats.object_count).unwrap_or(i64::MAX),
                stats.last_modified.as_ref().map(timestamp::format),
                timestamp::format(&stats.cached_at),
            ],
        )
        .map_err(|e| write_error("update_s3_stats", e))?;
        Ok(())
    }

    fn remove_s3_stats(&self, name: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM s3_stats_cache WHERE repo_name = ?1", [name])
            .map_err(|e| write_error("invalidate_s3_stats", e))?;
        Ok(())
    }
}

/// Raw column values, decoded into a `Repository` separately so a bad row can be skipped.
struct RepoRow {
    name: String,
    path: String,
    backup_target: String,
    hostname: String,
    os_platform: String,
    last_backup: Option<String>,
    last_s3_sync: Option<String>,
    created_at: Option<String>,
    metadata_json: Option<String>,
    retention: [Option<u32>; 4],
    passphrase: Option<String>,
    passphrase_file_path: Option<String>,
    passphrase_migrated: bool,
}

impl RepoRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get("name")?,
            path: row.get("path")?,
            backup_target: row.get("backup_target")?,
            hostname: row.get("hostname")?,
            os_platform: row.get("os_platform")?,
            last_backup: row.get("last_backup")?,
            last_s3_sync: row.get("last_s3_sync")?,
            created_at: row.get("created_at")?,
            metadata_json: row.get("metadata_json")?,
            retention: [
                row.get("retention_keep_daily")?,
                row.get("retention_keep_weekly")?,
                row.get("retention_keep_monthly")?,
                row.get("retention_keep_yearly")?,
            ],
            passphrase: row.get("passphrase")?,
            passphrase_file_path: row.get("passphrase_file_path")?,
            passphrase_migrated: row.get("passphrase_migrated")?,
        })
    }

    fn into_repository(self) -> Result<Repository> {
        let os_platform = self.os_platform.parse().map_err(|e: StorageError| {
            StorageError::storage("decode_row", format!("repository '{}': {e}", self.name))
        })?;

        let metadata = self.metadata_json.as_deref().and_then(|raw| {
            serde_json::from_str::<RepoMetadata>(raw)
                .map_err(|e| warn!(repo = %self.name, error = %e, "ignoring unreadable borg metadata"))
                .ok()
        });

        let retention_policy = match self.retention {
            [None, None, None, None] => None,
            [daily, weekly, monthly, yearly] => {
                let defaults = RetentionPolicy::default();
                Some(RetentionPolicy {
                    keep_daily: daily.unwrap_or(defaults.keep_daily),
                    keep_weekly: weekly.unwrap_or(defaults.keep_weekly),
                    keep_monthly: monthly.unwrap_or(defaults.keep_monthly),
                    keep_yearly: yearly.unwrap_or(defaults.keep_yearly),
                })
            }
        };

        Ok(Repository {
            last_backup: self.last_backup.as_deref().and_then(timestamp::parse),
            last_s3_sync: self.last_s3_sync.as_deref().and_then(timestamp::parse),
            created_at: self.created_at.as_deref().and_then(timestamp::parse),
            metadata,
            retention_policy,
            passphrase: self.passphrase,
            passphrase_file_path: self.passphrase_file_path,
            passphrase_migrated: self.passphrase_migrated,
            name: self.name,
            path: self.path,
            hostname: self.hostname,
            backup_target: self.backup_target,
            os_platform,
        })
    }
}

fn write_error(operation: &'static str, e: rusqlite::Error) -> StorageError {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        return StorageError::validation(format!("{operation} violates a uniqueness constraint: {e}"));
    }
    StorageError::with_source(operation, "database write failed", e)
}
