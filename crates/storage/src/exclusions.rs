use std::fs;
use std::path::{Path, PathBuf};

use borgboi_core::{Repository, Result, StorageError};

/// Per-repository borg exclude files, `<dir>/<name>_excludes.txt`.
///
/// Kept on disk for every backend because borg reads them by path.
#[derive(Debug, Clone)]
pub struct ExclusionStore {
    dir: PathBuf,
}

impl ExclusionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, repo_name: &str) -> Result<PathBuf> {
        if !Repository::is_safe_name(repo_name) {
            return Err(StorageError::InvalidArgument(format!(
                "invalid repository name for an exclusions file: '{repo_name}'"
            )));
        }
        Ok(self.dir.join(format!("{repo_name}_excludes.txt")))
    }

    pub fn list(&self, repo_name: &str) -> Result<Vec<String>> {
        let path = self.path(repo_name)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| {
            StorageError::with_source("get_exclusions", format!("read {}", path.display()), e)
        })?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn save(&self, repo_name: &str, patterns: &[String]) -> Result<()> {
        let path = self.path(repo_name)?;
        fs::create_dir_all(&self.dir).map_err(|e| {
            StorageError::with_source("save_exclusions", format!("create {}", self.dir.display()), e)
        })?;
        let mut body = patterns.join("\n");
        body.push('\n');
        fs::write(&path, body).map_err(|e| {
            StorageError::with_source("save_exclusions", format!("write {}", path.display()), e)
        })
    }

    /// Appends a pattern unless it is already present.
    pub fn add(&self, repo_name: &str, pattern: &str) -> Result<()> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(StorageError::InvalidArgument(
                "exclusion pattern cannot be empty".to_owned(),
            ));
        }
        if pattern.contains('\n') || pattern.contains('\r') {
            return Err(StorageError::InvalidArgument(
                "exclusion pattern cannot contain newline characters".to_owned(),
            ));
        }

        let mut patterns = self.list(repo_name)?;
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_owned());
            self.save(repo_name, &patterns)?;
        }
        Ok(())
    }

    /// Removes the pattern on 1-based `line_number`.
    pub fn remove(&self, repo_name: &str, line_number: usize) -> Result<String> {
        let mut patterns = self.list(repo_name)?;
        if line_number == 0 || line_number > patterns.len() {
            return Err(StorageError::InvalidArgument(format!(
                "invalid line number {line_number}"
            )));
        }
        let removed = patterns.remove(line_number - 1);
        self.save(repo_name, &patterns)?;
        Ok(removed)
    }

    pub fn delete_all(&self, repo_name: &str) -> Result<()> {
        let path = self.path(repo_name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::with_source(
                "delete_exclusions",
                format!("remove {}", path.display()),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_dedupes_and_remove_is_one_based() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ExclusionStore::new(tmp.path().join("exclusions"));

        assert!(store.list("docs").unwrap().is_empty());
        store.add("docs", "  *.tmp ").unwrap();
        store.add("docs", "*.tmp").unwrap();
        store.add("docs", "node_modules").unwrap();
        assert_eq!(store.list("docs").unwrap(), vec!["*.tmp", "node_modules"]);

        assert_eq!(store.remove("docs", 1).unwrap(), "*.tmp");
        assert_eq!(store.list("docs").unwrap(), vec!["node_modules"]);
        assert!(store.remove("docs", 5).is_err());
        assert!(store.remove("docs", 0).is_err());
    }

    #[test]
    fn rejects_empty_and_multiline_patterns() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ExclusionStore::new(tmp.path());
        assert!(matches!(store.add("docs", "   "), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(store.add("docs", "a\nb"), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn file_name_follows_layout() {
        let store = ExclusionStore::new("/data/exclusions");
        assert_eq!(
            store.path("docs").unwrap(),
            PathBuf::from("/data/exclusions/docs_excludes.txt")
        );
    }

    #[test]
    fn names_cannot_leave_the_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ExclusionStore::new(tmp.path().join("exclusions"));
        fs::write(tmp.path().join("victim_excludes.txt"), "keep\n").unwrap();

        assert!(matches!(store.path("../victim"), Err(StorageError::InvalidArgument(_))));
        assert!(store.list("../victim").is_err());
        assert!(store.delete_all("../victim").is_err());
        assert!(tmp.path().join("victim_excludes.txt").exists());
    }
}
