//! One-way upgrades from older on-disk layouts into the current backend.
//!
//! Every source is replayed record by record through the storage contract, so a
//! repository already present in the target is skipped and a second run over the
//! same sources only reports skips.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use borgboi_core::Result;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::decode::{decode_repository, decode_s3_stats, read_legacy_database};
use crate::store::{RepositoryStorage, S3StatsStore};

pub const LEGACY_DATABASE_FILE: &str = "borgboi.db";
pub const LEGACY_METADATA_DIR: &str = ".borgboi_metadata";

/// Counts for one migration run. Failed records are listed, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationResult {
    pub migrated: usize,
    pub skipped: usize,
    pub errors: Vec<(String, String)>,
}

impl MigrationResult {
    pub fn total_processed(&self) -> usize {
        self.migrated + self.skipped + self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn merge(&mut self, other: MigrationResult) {
        self.migrated += other.migrated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }

    fn fail(&mut self, id: impl Into<String>, reason: impl Into<String>) {
        let (id, reason) = (id.into(), reason.into());
        warn!(record = %id, reason = %reason, "failed to migrate record");
        self.errors.push((id, reason));
    }
}

/// A previous-generation layout found next to the current store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacySource {
    /// Single-file database at `<borgboi_dir>/borgboi.db`.
    Database(PathBuf),
    /// `<borgboi_dir>/data` with `repositories/*.json` and `s3_stats_cache.json`.
    JsonLayout(PathBuf),
    /// `<borgboi_dir>/.borgboi_metadata/*.json`.
    MetadataDir(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub sources: Vec<LegacySource>,
    pub repositories: MigrationResult,
    pub s3_stats: MigrationResult,
    pub removed_legacy_database: bool,
}

impl MigrationReport {
    pub fn has_errors(&self) -> bool {
        self.repositories.has_errors() || self.s3_stats.has_errors()
    }
}

/// Legacy sources under `borgboi_dir`, in the order they are replayed.
pub fn detect_sources(borgboi_dir: &Path) -> Vec<LegacySource> {
    let mut sources = Vec::new();

    let database = borgboi_dir.join(LEGACY_DATABASE_FILE);
    if database.is_file() {
        sources.push(LegacySource::Database(database));
    }
    let data_dir = borgboi_dir.join("data");
    if data_dir.join("repositories").is_dir() || data_dir.join("s3_stats_cache.json").is_file() {
        sources.push(LegacySource::JsonLayout(data_dir));
    }
    let metadata_dir = borgboi_dir.join(LEGACY_METADATA_DIR);
    if metadata_dir.is_dir() {
        sources.push(LegacySource::MetadataDir(metadata_dir));
    }
    sources
}

/// Replays every legacy source under `borgboi_dir` into a freshly created SQLite store.
///
/// The legacy database is deleted once all of its records made it across.
pub fn auto_migrate_sqlite<T>(target: &T, borgboi_dir: &Path) -> MigrationReport
where
    T: RepositoryStorage + S3StatsStore + ?Sized,
{
    let mut report = MigrationReport {
        sources: detect_sources(borgboi_dir),
        ..MigrationReport::default()
    };
    if report.sources.is_empty() {
        return report;
    }

    for source in report.sources.clone() {
        match source {
            LegacySource::Database(path) => {
                let (repos, stats) = migrate_database(target, &path);
                let clean = !repos.has_errors() && !stats.has_errors();
                report.repositories.merge(repos);
                report.s3_stats.merge(stats);
                if clean {
                    report.removed_legacy_database = remove_database_files(&path);
                }
            }
            LegacySource::JsonLayout(data_dir) => {
                report
                    .repositories
                    .merge(migrate_json_dir(target, &data_dir.join("repositories")));
                report
                    .s3_stats
                    .merge(migrate_s3_cache_file(target, &data_dir.join("s3_stats_cache.json")));
            }
            LegacySource::MetadataDir(dir) => {
                report.repositories.merge(migrate_json_dir(target, &dir));
            }
        }
    }

    info!(
        migrated = report.repositories.migrated,
        skipped = report.repositories.skipped,
        failed = report.repositories.errors.len(),
        s3_stats_migrated = report.s3_stats.migrated,
        removed_legacy_database = report.removed_legacy_database,
        "legacy data migration finished"
    );
    report
}

/// Replays `<legacy_dir>/*.json` into the offline store.
pub fn auto_migrate_offline<T>(target: &T, legacy_dir: &Path) -> MigrationResult
where
    T: RepositoryStorage + ?Sized,
{
    let result = migrate_json_dir(target, legacy_dir);
    if result.total_processed() > 0 {
        info!(
            migrated = result.migrated,
            skipped = result.skipped,
            failed = result.errors.len(),
            source = %legacy_dir.display(),
            "legacy metadata migration finished"
        );
    }
    result
}

/// Copies every repository from `source` into `target`. Existing names are skipped.
///
/// With `dry_run` nothing is written and `migrated` counts what would be copied.
pub fn transfer(
    source: &dyn RepositoryStorage,
    target: &dyn RepositoryStorage,
    dry_run: bool,
) -> Result<MigrationResult> {
    let mut result = MigrationResult::default();
    for repo in source.list_all()? {
        match target.exists(&repo.name) {
            Ok(true) => result.skipped += 1,
            Ok(false) if dry_run => result.migrated += 1,
            Ok(false) => match target.save(&repo) {
                Ok(()) => result.migrated += 1,
                Err(e) => result.fail(&repo.name, e.to_string()),
            },
            Err(e) => result.fail(&repo.name, e.to_string()),
        }
    }
    Ok(result)
}

/// Names in `source` that are missing from `target`, and those present in both.
pub fn verify_transfer(
    source: &dyn RepositoryStorage,
    target: &dyn RepositoryStorage,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut missing = Vec::new();
    let mut present = Vec::new();
    for repo in source.list_all()? {
        if target.exists(&repo.name)? {
            present.push(repo.name);
        } else {
            missing.push(repo.name);
        }
    }
    Ok((missing, present))
}

fn migrate_database<T>(target: &T, path: &Path) -> (MigrationResult, MigrationResult)
where
    T: RepositoryStorage + S3StatsStore + ?Sized,
{
    let mut repos = MigrationResult::default();
    let mut stats = MigrationResult::default();

    let db = match read_legacy_database(path) {
        Ok(db) => db,
        Err(e) => {
            repos.fail(path.display().to_string(), format!("cannot read legacy database: {e}"));
            return (repos, stats);
        }
    };
    for (label, row) in &db.repositories {
        migrate_repository(target, label, row, &mut repos);
    }
    for (label, row) in &db.s3_stats {
        migrate_stats(target, label, row, &mut stats);
    }
    (repos, stats)
}

fn migrate_json_dir<T>(target: &T, dir: &Path) -> MigrationResult
where
    T: RepositoryStorage + ?Sized,
{
    let mut result = MigrationResult::default();
    let files = match json_files(dir) {
        Ok(files) => files,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return result,
        Err(e) => {
            result.fail(dir.display().to_string(), format!("cannot list directory: {e}"));
            return result;
        }
    };

    for file in files {
        let label = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        match read_object(&file) {
            Ok(obj) => migrate_repository(target, &label, &obj, &mut result),
            Err(reason) => result.fail(label, reason),
        }
    }
    result
}

fn migrate_s3_cache_file<T>(target: &T, path: &Path) -> MigrationResult
where
    T: S3StatsStore + ?Sized,
{
    let mut result = MigrationResult::default();
    if !path.is_file() {
        return result;
    }
    let doc = match read_object(path) {
        Ok(doc) => doc,
        Err(reason) => {
            result.fail(path.display().to_string(), reason);
            return result;
        }
    };
    let Some(Value::Object(repos)) = doc.get("repos") else {
        return result;
    };
    for (name, entry) in repos {
        match entry {
            Value::Object(obj) => migrate_stats(target, name, obj, &mut result),
            _ => result.fail(name.clone(), "stats entry is not a JSON object"),
        }
    }
    result
}

fn migrate_repository<T>(target: &T, label: &str, obj: &Map<String, Value>, result: &mut MigrationResult)
where
    T: RepositoryStorage + ?Sized,
{
    let repo = match decode_repository(obj) {
        Ok(repo) => repo,
        Err(reason) => return result.fail(label, reason),
    };
    match target.exists(&repo.name) {
        Ok(true) => result.skipped += 1,
        Ok(false) => match target.save(&repo) {
            Ok(()) => result.migrated += 1,
            Err(e) => result.fail(label, e.to_string()),
        },
        Err(e) => result.fail(label, e.to_string()),
    }
}

fn migrate_stats<T>(target: &T, name: &str, obj: &Map<String, Value>, result: &mut MigrationResult)
where
    T: S3StatsStore + ?Sized,
{
    let stats = match decode_s3_stats(obj) {
        Ok(stats) => stats,
        Err(reason) => return result.fail(name, reason),
    };
    match target.get_s3_stats(name) {
        Ok(Some(_)) => result.skipped += 1,
        Ok(None) => match target.put_s3_stats(name, &stats) {
            Ok(()) => result.migrated += 1,
            Err(e) => result.fail(name, e.to_string()),
        },
        Err(e) => result.fail(name, e.to_string()),
    }
}

fn json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_object(path: &Path) -> std::result::Result<Map<String, Value>, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("file I/O error: {e}"))?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err("not a JSON object".to_owned()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

/// Removes the database file and its WAL companions. Returns whether the main file is gone.
fn remove_database_files(path: &Path) -> bool {
    let mut removed = true;
    for suffix in ["", "-wal", "-shm"] {
        let file = PathBuf::from(format!("{}{suffix}", path.display()));
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to remove legacy database file");
                if suffix.is_empty() {
                    removed = false;
                }
            }
        }
    }
    if removed {
        info!(path = %path.display(), "removed migrated legacy database");
    }
    removed
}
