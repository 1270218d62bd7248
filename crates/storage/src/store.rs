use borgboi_core::{Repository, Result, S3RepoStats, StorageError};
use tracing::warn;

/// Repository metadata operations, implemented by the offline, SQLite and DynamoDB backends.
pub trait RepositoryStorage: Send + Sync {
    /// Fetch a repository by its unique name.
    fn get(&self, name: &str) -> Result<Repository>;

    /// Fetch a repository by path, optionally pinned to one host.
    ///
    /// Without a hostname, a path registered on several hosts is a validation error
    /// naming every candidate host.
    fn get_by_path(&self, path: &str, hostname: Option<&str>) -> Result<Repository>;

    /// Every readable repository. Corrupt records are logged and skipped.
    fn list_all(&self) -> Result<Vec<Repository>>;

    /// Insert or update, keyed by name.
    fn save(&self, repo: &Repository) -> Result<()>;

    /// Remove a repository and any derived cache entries.
    fn delete(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;

    fn get_by_name_or_path(
        &self,
        name: Option<&str>,
        path: Option<&str>,
        hostname: Option<&str>,
    ) -> Result<Repository> {
        match (name, path) {
            (Some(name), _) => self.get(name),
            (None, Some(path)) => self.get_by_path(path, hostname),
            (None, None) => Err(StorageError::InvalidArgument(
                "either name or path must be provided".to_owned(),
            )),
        }
    }
}

/// Local cache of S3 usage per repository.
pub trait S3StatsStore {
    fn get_s3_stats(&self, name: &str) -> Result<Option<S3RepoStats>>;

    fn put_s3_stats(&self, name: &str, stats: &S3RepoStats) -> Result<()>;

    fn remove_s3_stats(&self, name: &str) -> Result<()>;

    /// Cache write failures are logged rather than returned.
    fn update_s3_stats(&self, name: &str, stats: &S3RepoStats) {
        if let Err(e) = self.put_s3_stats(name, stats) {
            warn!(repo = %name, error = %e, "failed to update s3 stats cache");
        }
    }

    fn invalidate_s3_stats(&self, name: &str) {
        if let Err(e) = self.remove_s3_stats(name) {
            warn!(repo = %name, error = %e, "failed to invalidate s3 stats cache");
        }
    }
}

/// Selects between matches of a path lookup, enforcing the ambiguity rule shared by all backends.
pub(crate) fn pick_path_match(
    path: &str,
    hostname: Option<&str>,
    mut matches: Vec<Repository>,
) -> Result<Repository> {
    if let Some(host) = hostname {
        matches.retain(|r| r.hostname == host);
    }
    match matches.len() {
        0 => Err(StorageError::not_found_path(path)),
        1 => Ok(matches.remove(0)),
        _ => {
            let mut hosts: Vec<String> = matches.into_iter().map(|r| r.hostname).collect();
            hosts.sort();
            hosts.dedup();
            Err(StorageError::ambiguous_path(path, &hosts))
        }
    }
}
