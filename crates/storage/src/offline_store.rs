use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use borgboi_core::{Config, Repository, Result, S3RepoStats, StorageError};
use chrono::Utc;
use tracing::{debug, warn};

use crate::exclusions::ExclusionStore;
use crate::index::{read_json, write_json_atomic, RepositoryIndex, RepositoryIndexEntry, S3StatsCacheFile};
use crate::migration::{auto_migrate_offline, MigrationResult};
use crate::store::{pick_path_match, RepositoryStorage, S3StatsStore};

pub const REPOSITORIES_DIR: &str = "repositories";
pub const INDEX_FILE: &str = "repositories_index.json";
pub const S3_CACHE_FILE: &str = "s3_stats_cache.json";

/// File-per-repository storage with a JSON index, for machines without network access.
///
/// Layout under the data directory:
/// `repositories/<name>.json`, `repositories_index.json`, `s3_stats_cache.json`, `exclusions/`.
///
/// The mutex only serialises callers inside this process. Two processes writing
/// the same directory can still interleave.
pub struct OfflineStore {
    data_dir: PathBuf,
    lock: Mutex<()>,
    exclusions: ExclusionStore,
    migration: Option<MigrationResult>,
}

impl OfflineStore {
    /// Opens the store without looking for legacy data.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let repos_dir = data_dir.join(REPOSITORIES_DIR);
        fs::create_dir_all(&repos_dir).map_err(|e| {
            StorageError::with_source("init", format!("create {}", repos_dir.display()), e)
        })?;
        let exclusions = ExclusionStore::new(data_dir.join("exclusions"));
        Ok(Self {
            data_dir,
            lock: Mutex::new(()),
            exclusions,
            migration: None,
        })
    }

    /// Opens the store, importing `legacy_dir/*.json` the first time the index is created.
    pub fn open(data_dir: impl Into<PathBuf>, legacy_dir: Option<&Path>) -> Result<Self> {
        let mut store = Self::new(data_dir)?;
        if store.index_path().exists() {
            return Ok(store);
        }

        write_json_atomic(&store.index_path(), &store.index_from_files(), "init")?;
        if let Some(dir) = legacy_dir.filter(|d| d.is_dir()) {
            store.migration = Some(auto_migrate_offline(&store, dir));
        }
        Ok(store)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(config.data_dir(), Some(&config.legacy_metadata_dir()))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn exclusions(&self) -> &ExclusionStore {
        &self.exclusions
    }

    /// Outcome of the legacy import run when this store was opened, if one ran.
    pub fn last_migration(&self) -> Option<&MigrationResult> {
        self.migration.as_ref()
    }

    /// Regenerates the index from the repository files on disk. Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize> {
        let _guard = self.guard();
        let index = self.index_from_files();
        self.save_index(&index)?;
        Ok(index.len())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE)
    }

    fn cache_path(&self) -> PathBuf {
        self.data_dir.join(S3_CACHE_FILE)
    }

    fn repos_dir(&self) -> PathBuf {
        self.data_dir.join(REPOSITORIES_DIR)
    }

    fn repo_file(&self, name: &str) -> PathBuf {
        self.repos_dir().join(format!("{name}.json"))
    }

    fn entry_file(&self, entry: &RepositoryIndexEntry) -> PathBuf {
        entry
            .metadata_file_location
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.repo_file(&entry.name))
    }

    // The helpers below expect the caller to hold `self.lock`.

    fn load_index(&self) -> RepositoryIndex {
        let path = self.index_path();
        if !path.exists() {
            return self.index_from_files();
        }
        match read_json(&path, "load_index") {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "repository index unreadable, rebuilding from files");
                self.index_from_files()
            }
        }
    }

    fn save_index(&self, index: &RepositoryIndex) -> Result<()> {
        write_json_atomic(&self.index_path(), index, "save_index")
    }

    fn load_cache(&self) -> S3StatsCacheFile {
        let path = self.cache_path();
        if !path.exists() {
            return S3StatsCacheFile::default();
        }
        read_json(&path, "load_s3_cache").unwrap_or_else(|e| {
            warn!(error = %e, "s3 stats cache unreadable, starting empty");
            S3StatsCacheFile::default()
        })
    }

    fn index_from_files(&self) -> RepositoryIndex {
        let mut index = RepositoryIndex::default();
        for (file, repo) in self.scan_files() {
            match repo {
                Ok(repo) => index.add(index_entry(&repo, &file)),
                Err(e) => warn!(file = %file.display(), error = %e, "skipping unreadable repository file"),
            }
        }
        index
    }

    fn scan_files(&self) -> Vec<(PathBuf, Result<Repository>)> {
        let dir = self.repos_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "cannot list repository files");
                }
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
            .into_iter()
            .map(|file| {
                let repo = read_json(&file, "read_repository");
                (file, repo)
            })
            .collect()
    }
}

fn index_entry(repo: &Repository, file: &Path) -> RepositoryIndexEntry {
    RepositoryIndexEntry {
        name: repo.name.clone(),
        path: repo.path.clone(),
        hostname: repo.hostname.clone(),
        metadata_file_location: Some(file.display().to_string()),
        last_updated: Utc::now(),
    }
}

impl RepositoryStorage for OfflineStore {
    fn get(&self, name: &str) -> Result<Repository> {
        if !Repository::is_safe_name(name) {
            return Err(StorageError::not_found_name(name));
        }
        let _guard = self.guard();
        let index = self.load_index();

        if let Some(entry) = index.get(name) {
            let file = self.entry_file(entry);
            if file.exists() {
                return read_json(&file, "get");
            }
            warn!(repo = %name, file = %file.display(), "indexed repository file missing");
        }

        let file = self.repo_file(name);
        if file.exists() {
            debug!(repo = %name, "repository found outside the index");
            return read_json(&file, "get");
        }
        Err(StorageError::not_found_name(name))
    }

    fn get_by_path(&self, path: &str, hostname: Option<&str>) -> Result<Repository> {
        let _guard = self.guard();
        let index = self.load_index();

        let mut matches = Vec::new();
        if let Some(entry) = index.find_by_path(path, hostname)? {
            match read_json::<Repository>(&self.entry_file(entry), "get_by_path") {
                Ok(repo) if hostname.is_some() => return Ok(repo),
                Ok(repo) => matches.push(repo),
                Err(e) => warn!(repo = %entry.name, error = %e, "indexed repository unreadable, scanning files"),
            }
        }

        // Unindexed files can still share the path on another host.
        for repo in self.scan_files().into_iter().filter_map(|(_, repo)| repo.ok()) {
            if repo.path == path && matches.iter().all(|m: &Repository| m.name != repo.name) {
                matches.push(repo);
            }
        }
        pick_path_match(path, hostname, matches)
    }

    fn list_all(&self) -> Result<Vec<Repository>> {
        let _guard = self.guard();
        let index = self.load_index();
        let mut seen = BTreeSet::new();
        let mut repos = Vec::new();

        for entry in index.repositories.values() {
            match read_json::<Repository>(&self.entry_file(entry), "list_all") {
                Ok(repo) => {
                    seen.insert(repo.name.clone());
                    repos.push(repo);
                }
                Err(e) => warn!(repo = %entry.name, error = %e, "skipping unreadable repository"),
            }
        }
        for (file, repo) in self.scan_files() {
            match repo {
                Ok(repo) if seen.insert(repo.name.clone()) => repos.push(repo),
                Ok(_) => {}
                Err(e) => {
                    let indexed = file
                        .file_stem()
                        .is_some_and(|stem| index.get(&stem.to_string_lossy()).is_some());
                    if !indexed {
                        warn!(file = %file.display(), error = %e, "skipping unreadable repository file");
                    }
                }
            }
        }

        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    fn save(&self, repo: &Repository) -> Result<()> {
        repo.validate()?;
        let _guard = self.guard();
        let mut index = self.load_index();

        if let Some(other) = index
            .repositories
            .values()
            .find(|e| e.name != repo.name && e.path == repo.path && e.hostname == repo.hostname)
        {
            return Err(StorageError::invalid_field(
                "path",
                format!(
                    "path '{}' on host '{}' is already registered as '{}'",
                    repo.path, repo.hostname, other.name
                ),
            ));
        }

        let file = self.repo_file(&repo.name);
        write_json_atomic(&file, repo, "save")?;
        index.add(index_entry(repo, &file));
        self.save_index(&index)
    }

    fn delete(&self, name: &str) -> Result<()> {
        if !Repository::is_safe_name(name) {
            return Err(StorageError::not_found_name(name));
        }
        let _guard = self.guard();
        let mut index = self.load_index();

        let entry = index.remove(name);
        let file = entry
            .as_ref()
            .map(|e| self.entry_file(e))
            .unwrap_or_else(|| self.repo_file(name));
        if entry.is_none() && !file.exists() {
            return Err(StorageError::not_found_name(name));
        }

        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::with_source(
                    "delete",
                    format!("remove {}", file.display()),
                    e,
                ))
            }
        }
        if entry.is_some() {
            self.save_index(&index)?;
        }

        let mut cache = self.load_cache();
        if cache.invalidate(name) {
            write_json_atomic(&self.cache_path(), &cache, "delete")?;
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        if !Repository::is_safe_name(name) {
            return Ok(false);
        }
        let _guard = self.guard();
        Ok(self.load_index().get(name).is_some() || self.repo_file(name).exists())
    }
}

impl S3StatsStore for OfflineStore {
    fn get_s3_stats(&self, name: &str) -> Result<Option<S3RepoStats>> {
        let _guard = self.guard();
        Ok(self.load_cache().get(name).cloned())
    }

    fn put_s3_stats(&self, name: &str, stats: &S3RepoStats) -> Result<()> {
        let _guard = self.guard();
        let mut cache = self.load_cache();
        cache.update(name, stats.clone());
        write_json_atomic(&self.cache_path(), &cache, "update_s3_stats")
    }

    fn remove_s3_stats(&self, name: &str) -> Result<()> {
        let _guard = self.guard();
        let mut cache = self.load_cache();
        if cache.invalidate(name) {
            write_json_atomic(&self.cache_path(), &cache, "invalidate_s3_stats")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use borgboi_core::OsPlatform;

    use super::*;

    fn repo(name: &str, path: &str, host: &str) -> Repository {
        Repository::new(name, path, host, "/home/me/data", OsPlatform::Linux)
    }

    #[test]
    fn get_falls_back_to_file_when_index_lacks_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("docs", "/repo/docs", "box1")).unwrap();

        write_json_atomic(&store.index_path(), &RepositoryIndex::default(), "test").unwrap();
        assert_eq!(store.get("docs").unwrap().path, "/repo/docs");
        assert!(store.exists("docs").unwrap());
        assert_eq!(store.get_by_path("/repo/docs", None).unwrap().name, "docs");
    }

    #[test]
    fn corrupt_index_is_rebuilt_from_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("a", "/a", "h")).unwrap();
        store.save(&repo("b", "/b", "h")).unwrap();

        fs::write(store.index_path(), "{ not json").unwrap();
        let names: Vec<String> = store.list_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.rebuild_index().unwrap(), 2);
        let index: RepositoryIndex = read_json(&store.index_path(), "test").unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn list_all_skips_corrupt_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("good", "/good", "h")).unwrap();
        fs::write(store.repo_file("broken"), "{\"name\": 42}").unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "good");
    }

    #[test]
    fn delete_drops_file_index_entry_and_cache() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("docs", "/repo/docs", "box1")).unwrap();
        store.update_s3_stats("docs", &S3RepoStats::new(10, 1, None));
        assert!(store.get_s3_stats("docs").unwrap().is_some());

        store.delete("docs").unwrap();
        assert!(!store.repo_file("docs").exists());
        assert!(!store.exists("docs").unwrap());
        assert!(store.get_s3_stats("docs").unwrap().is_none());
        assert!(store.delete("docs").unwrap_err().is_not_found());
    }

    #[test]
    fn save_rejects_second_name_for_same_path_and_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("one", "/shared", "box1")).unwrap();
        let err = store.save(&repo("two", "/shared", "box1")).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
        store.save(&repo("two", "/shared", "box2")).unwrap();
    }

    #[test]
    fn open_imports_legacy_metadata_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let legacy = tmp.path().join(".borgboi_metadata");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(
            legacy.join("old.json"),
            r#"{"name": "old", "path": "/old", "hostname": "h", "backup_target": "/t", "os_platform": "Linux"}"#,
        )
        .unwrap();
        fs::write(legacy.join("junk.json"), "[]").unwrap();

        let data = tmp.path().join("data");
        let store = OfflineStore::open(&data, Some(&legacy)).expect("store");
        let result = store.last_migration().expect("migration ran");
        assert_eq!(result.migrated, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(store.get("old").unwrap().path, "/old");

        let reopened = OfflineStore::open(&data, Some(&legacy)).expect("store");
        assert!(reopened.last_migration().is_none());
    }

    #[test]
    fn names_outside_the_repositories_dir_are_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path().join("data"), None).expect("store");
        let victim = tmp.path().join("data").join("victim.json");
        fs::write(&victim, r#"{"name": "victim"}"#).unwrap();

        assert!(!store.exists("../victim").unwrap());
        assert!(store.delete("../victim").unwrap_err().is_not_found());
        assert!(victim.exists());
        assert!(store.get("../repositories_index").unwrap_err().is_not_found());
        assert!(store.get("..\\victim").unwrap_err().is_not_found());
    }

    #[test]
    fn concurrent_saves_all_reach_the_index() {
        use std::sync::Arc;
        use std::thread;

        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OfflineStore::open(tmp.path(), None).expect("store"));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..10 {
                        let name = format!("repo-{t}-{i}");
                        store
                            .save(&repo(&name, &format!("/repo/{name}"), "box1"))
                            .expect("save");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let index: RepositoryIndex = read_json(&store.index_path(), "test").unwrap();
        assert_eq!(index.len(), 80);
        assert_eq!(store.list_all().unwrap().len(), 80);
    }

    #[test]
    fn unindexed_file_on_another_host_makes_path_ambiguous() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = OfflineStore::open(tmp.path(), None).expect("store");
        store.save(&repo("docs-box1", "/shared/docs", "box1")).unwrap();
        let stray = repo("docs-box2", "/shared/docs", "box2");
        write_json_atomic(&store.repo_file("docs-box2"), &stray, "test").unwrap();

        let err = store.get_by_path("/shared/docs", None).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }), "{err:?}");
        assert!(err.to_string().contains("box2"));
        assert_eq!(store.get_by_path("/shared/docs", Some("box2")).unwrap().name, "docs-box2");
        assert_eq!(store.get_by_path("/shared/docs", Some("box1")).unwrap().name, "docs-box1");
    }
}
