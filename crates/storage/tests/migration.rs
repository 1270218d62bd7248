use std::fs;
use std::path::{Path, PathBuf};

use borgboi_core::{Config, OsPlatform, Repository};
use borgboi_storage::migration::{auto_migrate_sqlite, transfer, verify_transfer, LegacySource};
use borgboi_storage::{OfflineStore, RepositoryStorage, S3StatsStore, SqliteStore};
use rusqlite::Connection;
use serde_json::json;

fn write_legacy_database(path: &Path, rows: &[(&str, &str, &str)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE repositories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            backup_target TEXT NOT NULL,
            hostname TEXT NOT NULL,
            os_platform TEXT NOT NULL,
            last_backup TEXT,
            metadata_json TEXT,
            passphrase TEXT,
            passphrase_file_path TEXT,
            passphrase_migrated INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE s3_stats_cache (
            id INTEGER PRIMARY KEY,
            repo_name TEXT NOT NULL UNIQUE,
            total_size_bytes INTEGER NOT NULL,
            object_count INTEGER NOT NULL,
            last_modified TEXT,
            cached_at TEXT NOT NULL
        );",
    )
    .unwrap();
    for (name, path, os) in rows {
        conn.execute(
            "INSERT INTO repositories (name, path, backup_target, hostname, os_platform, last_backup, passphrase)
             VALUES (?1, ?2, '/home/me', 'box1', ?3, '2025-01-15 10:00:00.000000', 'inline-secret')",
            [name, path, os],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO s3_stats_cache (repo_name, total_size_bytes, object_count, last_modified, cached_at)
         VALUES ('legacy-repo', 4096, 12, '2025-01-15T10:00:00', '2025-01-16T00:00:00')",
        [],
    )
    .unwrap();
}

fn write_json(path: PathBuf, value: serde_json::Value) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn repo_json(name: &str, path: &str) -> serde_json::Value {
    json!({
        "name": name,
        "path": path,
        "hostname": "box1",
        "backup_target": "/home/me",
        "os_platform": "Linux",
        "metadata": null,
        "passphrase_migrated": false
    })
}

#[test]
fn legacy_database_is_migrated_then_removed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().with_home(tmp.path());
    let borgboi_dir = config.borgboi_dir();
    fs::create_dir_all(&borgboi_dir).unwrap();
    let legacy = config.legacy_database_path();
    write_legacy_database(&legacy, &[("legacy-repo", "/repo/legacy", "Linux")]);
    fs::write(format!("{}-wal", legacy.display()), b"").unwrap();

    let store = SqliteStore::from_config(&config).expect("open store");

    assert!(!legacy.exists());
    assert!(!PathBuf::from(format!("{}-wal", legacy.display())).exists());
    let repo = store.get("legacy-repo").expect("migrated repository");
    assert_eq!(repo.path, "/repo/legacy");
    assert_eq!(repo.passphrase.as_deref(), Some("inline-secret"));
    assert!(repo.last_backup.is_some());

    let stats = store.get_s3_stats("legacy-repo").unwrap().expect("migrated stats");
    assert_eq!(stats.total_size_bytes, 4096);
    assert_eq!(stats.object_count, 12);

    let report = store.last_migration().expect("migration ran");
    assert_eq!(report.sources, vec![LegacySource::Database(legacy)]);
    assert_eq!(report.repositories.migrated, 1);
    assert!(report.removed_legacy_database);
}

#[test]
fn legacy_database_with_failures_is_kept() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().with_home(tmp.path());
    fs::create_dir_all(config.borgboi_dir()).unwrap();
    let legacy = config.legacy_database_path();
    write_legacy_database(
        &legacy,
        &[("legacy-repo", "/repo/legacy", "Linux"), ("haiku-repo", "/repo/haiku", "Haiku")],
    );

    let store = SqliteStore::from_config(&config).expect("open store");
    let report = store.last_migration().expect("migration ran");

    assert_eq!(report.repositories.migrated, 1);
    assert_eq!(report.repositories.errors.len(), 1);
    assert_eq!(report.repositories.errors[0].0, "haiku-repo");
    assert!(!report.removed_legacy_database);
    assert!(legacy.exists());
    assert!(store.exists("legacy-repo").unwrap());
}

#[test]
fn rerun_after_fixing_the_failed_row_removes_the_legacy_database() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().with_home(tmp.path());
    fs::create_dir_all(config.borgboi_dir()).unwrap();
    let legacy = config.legacy_database_path();
    write_legacy_database(
        &legacy,
        &[("legacy-repo", "/repo/legacy", "Linux"), ("haiku-repo", "/repo/haiku", "Haiku")],
    );
    let store = SqliteStore::from_config(&config).expect("open store");
    assert!(legacy.exists());

    Connection::open(&legacy)
        .unwrap()
        .execute("UPDATE repositories SET os_platform = 'Darwin' WHERE name = 'haiku-repo'", [])
        .unwrap();
    let report = auto_migrate_sqlite(&store, &config.borgboi_dir());

    assert_eq!(report.repositories.migrated, 1);
    assert_eq!(report.repositories.skipped, 1);
    assert!(!report.has_errors());
    assert!(report.removed_legacy_database);
    assert!(!legacy.exists());
    assert_eq!(store.get("haiku-repo").unwrap().os_platform, OsPlatform::Darwin);
}

#[test]
fn json_layouts_migrate_and_rerun_only_skips() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().with_home(tmp.path());
    let borgboi_dir = config.borgboi_dir();
    let data = config.data_dir();

    write_json(data.join("repositories").join("photos.json"), repo_json("photos", "/repo/photos"));
    write_json(data.join("repositories").join("music.json"), repo_json("music", "/repo/music"));
    fs::write(data.join("repositories").join("broken.json"), "{ nope").unwrap();
    write_json(
        data.join("s3_stats_cache.json"),
        json!({"version": 1, "repos": {"photos": {"total_size_bytes": 1000, "object_count": 4}}}),
    );
    write_json(
        config.legacy_metadata_dir().join("old.json"),
        repo_json("old", "/repo/old"),
    );
    // Present in both layouts: the second copy is a skip, not a duplicate.
    write_json(config.legacy_metadata_dir().join("music.json"), repo_json("music", "/repo/music"));

    let store = SqliteStore::from_config(&config).expect("open store");
    let first = store.last_migration().expect("migration ran").clone();
    assert_eq!(first.repositories.migrated, 3);
    assert_eq!(first.repositories.skipped, 1);
    assert_eq!(first.repositories.errors.len(), 1);
    assert_eq!(first.repositories.errors[0].0, "broken.json");
    assert_eq!(first.s3_stats.migrated, 1);
    assert!(data.join("repositories").exists());
    assert!(config.legacy_metadata_dir().exists());

    let second = auto_migrate_sqlite(&store, &borgboi_dir);
    assert_eq!(second.repositories.migrated, 0);
    assert_eq!(second.repositories.skipped, 4);
    assert_eq!(second.s3_stats.skipped, 1);
    assert_eq!(store.list_all().unwrap().len(), 3);
}

#[test]
fn existing_database_is_not_migrated_again() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = Config::default().with_home(tmp.path());
    drop(SqliteStore::from_config(&config).expect("first open"));

    write_json(
        config.data_dir().join("repositories").join("late.json"),
        repo_json("late", "/repo/late"),
    );
    let store = SqliteStore::from_config(&config).expect("second open");
    assert!(store.last_migration().is_none());
    assert!(!store.exists("late").unwrap());
}

#[test]
fn transfer_copies_between_backends() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let source = OfflineStore::open(tmp.path().join("data"), None).unwrap();
    let target = SqliteStore::open(tmp.path().join("db").join("borgboi.db"), None).unwrap();
    for (name, path) in [("a", "/repo/a"), ("b", "/repo/b")] {
        source
            .save(&Repository::new(name, path, "box1", "/src", OsPlatform::Linux))
            .unwrap();
    }
    target
        .save(&Repository::new("b", "/repo/b", "box1", "/src", OsPlatform::Linux))
        .unwrap();

    let dry = transfer(&source, &target, true).unwrap();
    assert_eq!((dry.migrated, dry.skipped), (1, 1));
    assert!(!target.exists("a").unwrap());

    let (missing, present) = verify_transfer(&source, &target).unwrap();
    assert_eq!(missing, vec!["a"]);
    assert_eq!(present, vec!["b"]);

    let real = transfer(&source, &target, false).unwrap();
    assert_eq!((real.migrated, real.skipped), (1, 1));
    let (missing, _) = verify_transfer(&source, &target).unwrap();
    assert!(missing.is_empty());
}
