//! JSON documents kept next to the per-repository files of the offline store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use borgboi_core::{Result, S3RepoStats, StorageError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lightweight pointer to a repository metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryIndexEntry {
    pub name: String,
    pub path: String,
    pub hostname: String,
    #[serde(default, rename = "metadata_file")]
    pub metadata_file_location: Option<String>,
    #[serde(default = "Utc::now", with = "borgboi_core::timestamp::or_now")]
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryIndex {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryIndexEntry>,
    #[serde(default = "Utc::now", with = "borgboi_core::timestamp::or_now")]
    pub last_updated: DateTime<Utc>,
}

impl Default for RepositoryIndex {
    fn default() -> Self {
        Self {
            version: default_version(),
            repositories: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl RepositoryIndex {
    pub fn add(&mut self, entry: RepositoryIndexEntry) {
        self.repositories.insert(entry.name.clone(), entry);
        self.last_updated = Utc::now();
    }

    pub fn remove(&mut self, name: &str) -> Option<RepositoryIndexEntry> {
        let removed = self.repositories.remove(name);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryIndexEntry> {
        self.repositories.get(name)
    }

    /// Finds the entry at `path`. Several hosts sharing the path without a hostname is an error.
    pub fn find_by_path(&self, path: &str, hostname: Option<&str>) -> Result<Option<&RepositoryIndexEntry>> {
        let matches: Vec<&RepositoryIndexEntry> = self
            .repositories
            .values()
            .filter(|e| e.path == path && hostname.map_or(true, |h| e.hostname == h))
            .collect();

        if matches.len() > 1 && hostname.is_none() {
            let hosts: Vec<String> = matches.iter().map(|e| e.hostname.clone()).collect();
            return Err(StorageError::ambiguous_path(path, &hosts));
        }
        Ok(matches.into_iter().next())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StatsCacheFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub repos: BTreeMap<String, S3RepoStats>,
    #[serde(default = "Utc::now", with = "borgboi_core::timestamp::or_now")]
    pub last_updated: DateTime<Utc>,
}

impl Default for S3StatsCacheFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            repos: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl S3StatsCacheFile {
    pub fn get(&self, name: &str) -> Option<&S3RepoStats> {
        self.repos.get(name)
    }

    pub fn update(&mut self, name: &str, stats: S3RepoStats) {
        self.repos.insert(name.to_owned(), stats);
        self.last_updated = Utc::now();
    }

    pub fn invalidate(&mut self, name: &str) -> bool {
        let removed = self.repos.remove(name).is_some();
        if removed {
            self.last_updated = Utc::now();
        }
        removed
    }

    pub fn invalidate_all(&mut self) {
        self.repos.clear();
        self.last_updated = Utc::now();
    }
}

fn default_version() -> u32 {
    1
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, operation: &'static str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StorageError::with_source(operation, format!("read {}", path.display()), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| StorageError::with_source(operation, format!("parse {}", path.display()), e))
}

/// Writes `value` to a temp file in the destination directory, then renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T, operation: &'static str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::storage(operation, format!("{} has no parent directory", path.display())))?;
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::with_source(operation, format!("serialize {}", path.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| StorageError::with_source(operation, format!("create temp file in {}", dir.display()), e))?;
    tmp.write_all(raw.as_bytes())
        .map_err(|e| StorageError::with_source(operation, format!("write temp file for {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::with_source(operation, format!("replace {}", path.display()), e.error))?;
    Ok(())
}
