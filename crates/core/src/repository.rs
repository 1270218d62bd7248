use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

const GIBIBYTES_IN_GIGABYTE: f64 = 0.931_322_574_615_48;

/// Operating systems a repository may be registered from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    Darwin,
}

impl OsPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsPlatform::Linux => "Linux",
            OsPlatform::Darwin => "Darwin",
        }
    }

    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            OsPlatform::Darwin
        } else {
            OsPlatform::Linux
        }
    }
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsPlatform {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "Linux" => Ok(OsPlatform::Linux),
            "Darwin" => Ok(OsPlatform::Darwin),
            other => Err(StorageError::invalid_field(
                "os_platform",
                format!("os_platform must be either 'Linux' or 'Darwin', '{other}' is not supported"),
            )),
        }
    }
}

/// How many archives `borg prune` keeps at each interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 0,
        }
    }
}

impl RetentionPolicy {
    pub fn to_borg_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--keep-daily={}", self.keep_daily),
            format!("--keep-weekly={}", self.keep_weekly),
            format!("--keep-monthly={}", self.keep_monthly),
        ];
        if self.keep_yearly > 0 {
            args.push(format!("--keep-yearly={}", self.keep_yearly));
        }
        args
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoStats {
    pub total_chunks: u64,
    pub total_csize: u64,
    pub total_size: u64,
    pub total_unique_chunks: u64,
    pub unique_csize: u64,
    pub unique_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoCache {
    pub path: String,
    pub stats: RepoStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoEncryption {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoLocation {
    pub id: String,
    pub last_modified: String,
    pub location: String,
}

/// Snapshot of `borg info --json` for a repository. Stored as-is by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoMetadata {
    pub cache: RepoCache,
    pub encryption: RepoEncryption,
    pub repository: RepoLocation,
    pub security_dir: String,
    #[serde(default)]
    pub archives: Vec<serde_json::Value>,
}

impl RepoMetadata {
    pub fn total_size_gb(&self) -> String {
        to_gb(self.cache.stats.total_size)
    }

    pub fn total_csize_gb(&self) -> String {
        to_gb(self.cache.stats.total_csize)
    }

    pub fn unique_csize_gb(&self) -> String {
        to_gb(self.cache.stats.unique_csize)
    }
}

fn to_gb(bytes: u64) -> String {
    format!(
        "{:.2}",
        bytes as f64 / 1024.0 / 1024.0 / 1024.0 / GIBIBYTES_IN_GIGABYTE
    )
}

/// A registered borg repository.
///
/// `name` is unique across all hosts, `(path, hostname)` is unique per host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub name: String,
    pub path: String,
    pub hostname: String,
    pub backup_target: String,
    pub os_platform: OsPlatform,
    #[serde(default, with = "crate::timestamp::option")]
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub last_s3_sync: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<RepoMetadata>,
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
    /// Deprecated inline secret, only read while migrating it to a passphrase file.
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub passphrase_file_path: Option<String>,
    #[serde(default)]
    pub passphrase_migrated: bool,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        hostname: impl Into<String>,
        backup_target: impl Into<String>,
        os_platform: OsPlatform,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            hostname: hostname.into(),
            backup_target: backup_target.into(),
            os_platform,
            last_backup: None,
            last_s3_sync: None,
            created_at: Some(Utc::now()),
            metadata: None,
            retention_policy: None,
            passphrase: None,
            passphrase_file_path: None,
            passphrase_migrated: false,
        }
    }

    /// Checks the structural rules a record must satisfy before it is persisted.
    pub fn validate(&self) -> Result<(), StorageError> {
        for (field, value) in [
            ("name", &self.name),
            ("path", &self.path),
            ("hostname", &self.hostname),
            ("backup_target", &self.backup_target),
        ] {
            if value.trim().is_empty() {
                return Err(StorageError::invalid_field(field, format!("{field} must not be empty")));
            }
        }
        if !Self::is_safe_name(&self.name) {
            return Err(StorageError::invalid_field(
                "name",
                format!("repository name '{}' must not contain path separators", self.name),
            ));
        }
        Ok(())
    }

    /// Whether `name` can be used as a single file-name component.
    pub fn is_safe_name(name: &str) -> bool {
        !name.trim().is_empty() && !name.contains(['/', '\\', '\0']) && name != "." && name != ".."
    }

    pub fn effective_retention(&self, default: Option<RetentionPolicy>) -> RetentionPolicy {
        self.retention_policy.or(default).unwrap_or_default()
    }

    /// Repository path with the home directory prefix swapped for the current OS.
    pub fn safe_path(&self) -> String {
        match OsPlatform::current() {
            OsPlatform::Darwin if self.path.starts_with("/home/") => {
                self.path.replacen("/home/", "/Users/", 1)
            }
            OsPlatform::Linux if self.path.starts_with("/Users/") => {
                self.path.replacen("/Users/", "/home/", 1)
            }
            _ => self.path.clone(),
        }
    }

    pub fn has_passphrase_file(&self) -> bool {
        self.passphrase_file_path
            .as_deref()
            .is_some_and(|p| Path::new(p).exists())
    }
}
