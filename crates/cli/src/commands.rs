use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use borgboi_core::{Config, Repository};
use borgboi_passphrase::{migrate_all, PassphraseStore};
use borgboi_storage::migration::{auto_migrate_sqlite, transfer, verify_transfer};
use borgboi_storage::{MigrationReport, OfflineStore, RepositoryStorage, SqliteStore};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Show(String),
    ShowPath { path: String, hostname: Option<String> },
    Remove(String),
    MigratePassphrases,
    MigrateLegacy,
    ExportOffline(PathBuf),
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command");
        };
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
        Ok(match (name.as_str(), rest.as_slice()) {
            ("list", []) => Self::List,
            ("show", [repo]) => Self::Show((*repo).to_owned()),
            ("show-path", [path]) => Self::ShowPath {
                path: (*path).to_owned(),
                hostname: None,
            },
            ("show-path", [path, host]) => Self::ShowPath {
                path: (*path).to_owned(),
                hostname: Some((*host).to_owned()),
            },
            ("remove", [repo]) => Self::Remove((*repo).to_owned()),
            ("migrate-passphrases", []) => Self::MigratePassphrases,
            ("migrate-legacy", []) => Self::MigrateLegacy,
            ("export-offline", [dir]) => Self::ExportOffline(PathBuf::from(dir)),
            (other, _) => bail!("unknown command or wrong arguments: {other}"),
        })
    }
}

pub fn run(cfg: &Config, storage: &dyn RepositoryStorage, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for repo in storage.list_all()? {
                println!("{}", list_line(&repo));
            }
        }
        Command::Show(name) => print_repository(&storage.get(&name)?)?,
        Command::ShowPath { path, hostname } => {
            print_repository(&storage.get_by_path(&path, hostname.as_deref())?)?
        }
        Command::Remove(name) => {
            storage.delete(&name)?;
            info!(repo = %name, "removed repository metadata");
        }
        Command::MigratePassphrases => {
            let store = PassphraseStore::from_config(cfg);
            let result = migrate_all(storage, &store)?;
            println!(
                "passphrases: {} migrated, {} skipped, {} failed",
                result.migrated,
                result.skipped,
                result.errors.len()
            );
            if result.has_errors() {
                bail!("passphrase migration failed for {} repositories", result.errors.len());
            }
        }
        Command::MigrateLegacy => migrate_legacy(cfg)?,
        Command::ExportOffline(dir) => {
            let target = OfflineStore::open(&dir, None)
                .with_context(|| format!("opening offline store at {}", dir.display()))?;
            let result = transfer(storage, &target, false)?;
            let (missing, _) = verify_transfer(storage, &target)?;
            println!(
                "export: {} copied, {} already present, {} failed",
                result.migrated,
                result.skipped,
                result.errors.len()
            );
            if !missing.is_empty() {
                warn!(?missing, "repositories missing from export");
                bail!("{} repositories were not exported", missing.len());
            }
        }
    }
    Ok(())
}

/// Always targets the local SQLite database, whatever backend is selected.
pub fn migrate_legacy(cfg: &Config) -> Result<()> {
    let store = SqliteStore::from_config(cfg)
        .with_context(|| format!("opening {}", cfg.database_path().display()))?;
    report_legacy_migration(&legacy_migration(&store, cfg))
}

/// The run done while creating the database, or a fresh replay of whatever legacy data remains.
fn legacy_migration(store: &SqliteStore, cfg: &Config) -> MigrationReport {
    match store.last_migration() {
        Some(report) => report.clone(),
        None => auto_migrate_sqlite(store, &cfg.borgboi_dir()),
    }
}

fn report_legacy_migration(report: &MigrationReport) -> Result<()> {
    println!(
        "legacy repositories: {} migrated, {} skipped, {} failed",
        report.repositories.migrated,
        report.repositories.skipped,
        report.repositories.errors.len()
    );
    println!("legacy database removed: {}", report.removed_legacy_database);
    for (record, reason) in report.repositories.errors.iter().chain(&report.s3_stats.errors) {
        warn!(%record, %reason, "legacy record not migrated");
    }
    if report.has_errors() {
        bail!("legacy migration left records behind; fix them and rerun migrate-legacy");
    }
    Ok(())
}

fn list_line(repo: &Repository) -> String {
    let last_backup = repo
        .last_backup
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_owned());
    format!(
        "{}\t{}\t{}\t{}",
        repo.name, repo.hostname, repo.path, last_backup
    )
}

/// Pretty JSON with the legacy inline secret masked.
fn print_repository(repo: &Repository) -> Result<()> {
    let mut shown = repo.clone();
    if shown.passphrase.is_some() {
        shown.passphrase = Some("<redacted>".to_owned());
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use borgboi_core::OsPlatform;
    use chrono::{TimeZone, Utc};

    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parses_each_command() {
        assert_eq!(Command::parse(&strings(&["list"])).unwrap(), Command::List);
        assert_eq!(
            Command::parse(&strings(&["show-path", "/r", "box1"])).unwrap(),
            Command::ShowPath {
                path: "/r".into(),
                hostname: Some("box1".into())
            }
        );
        assert_eq!(
            Command::parse(&strings(&["export-offline", "/tmp/out"])).unwrap(),
            Command::ExportOffline(PathBuf::from("/tmp/out"))
        );
        assert_eq!(
            Command::parse(&strings(&["migrate-legacy"])).unwrap(),
            Command::MigrateLegacy
        );
        assert!(Command::parse(&strings(&["show"])).is_err());
        assert!(Command::parse(&strings(&["list", "extra"])).is_err());
    }

    #[test]
    fn list_line_shows_never_for_unbacked_repos() {
        let mut repo = Repository::new("docs", "/repo/docs", "box1", "/docs", OsPlatform::Linux);
        assert_eq!(list_line(&repo), "docs\tbox1\t/repo/docs\tnever");
        repo.last_backup = Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap());
        assert_eq!(list_line(&repo), "docs\tbox1\t/repo/docs\t2025-03-01 12:30");
    }
}
