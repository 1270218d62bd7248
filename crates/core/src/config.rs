use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::repository::RetentionPolicy;

pub const BORGBOI_DIR_NAME: &str = ".borgboi";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DYNAMODB_REPOS_TABLE: &str = "bb-repos";
pub const DEFAULT_S3_BUCKET: &str = "bb-backups";
pub const DEFAULT_AWS_REGION: &str = "us-west-1";
pub const DEFAULT_NAME_INDEX: &str = "name_gsi";

const VALID_COMPRESSION: [&str; 5] = ["none", "lz4", "zstd", "zlib", "lzma"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub offline: bool,
    pub debug: bool,
    pub aws: AwsConfig,
    pub borg: BorgConfig,
    /// Root under which `.borgboi` lives. Resolved from the environment when unset.
    #[serde(skip)]
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub dynamodb_repos_table: String,
    pub dynamodb_name_index: String,
    pub s3_bucket: String,
    pub region: String,
    pub profile: Option<String>,
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            dynamodb_repos_table: DEFAULT_DYNAMODB_REPOS_TABLE.to_owned(),
            dynamodb_name_index: DEFAULT_NAME_INDEX.to_owned(),
            s3_bucket: DEFAULT_S3_BUCKET.to_owned(),
            region: DEFAULT_AWS_REGION.to_owned(),
            profile: None,
            endpoint_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BorgConfig {
    pub executable_path: String,
    pub compression: String,
    pub retention: RetentionPolicy,
    pub borg_passphrase: Option<String>,
    pub borg_new_passphrase: Option<String>,
}

impl Default for BorgConfig {
    fn default() -> Self {
        Self {
            executable_path: "borg".to_owned(),
            compression: "zstd,6".to_owned(),
            retention: RetentionPolicy::default(),
            borg_passphrase: None,
            borg_new_passphrase: None,
        }
    }
}

impl Config {
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn home_dir(&self) -> PathBuf {
        self.home
            .clone()
            .unwrap_or_else(|| resolve_home_dir_with(|k| env::var(k).ok()))
    }

    pub fn borgboi_dir(&self) -> PathBuf {
        self.home_dir().join(BORGBOI_DIR_NAME)
    }

    pub fn passphrases_dir(&self) -> PathBuf {
        self.borgboi_dir().join("passphrases")
    }

    /// Directory of the file-per-repository store.
    pub fn data_dir(&self) -> PathBuf {
        self.borgboi_dir().join("data")
    }

    pub fn exclusions_dir(&self) -> PathBuf {
        self.data_dir().join("exclusions")
    }

    pub fn database_path(&self) -> PathBuf {
        self.borgboi_dir().join(".database").join("borgboi.db")
    }

    /// Location of the single-file database written before `.database/` existed.
    pub fn legacy_database_path(&self) -> PathBuf {
        self.borgboi_dir().join("borgboi.db")
    }

    pub fn legacy_metadata_dir(&self) -> PathBuf {
        self.borgboi_dir().join(".borgboi_metadata")
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_with(|key| env::var(key).ok());
    }

    /// Applies `BORGBOI_*` overrides read through `lookup`.
    pub fn apply_env_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BORGBOI_OFFLINE").and_then(|v| parse_bool(&v)) {
            self.offline = v;
        }
        if let Some(v) = lookup("BORGBOI_DEBUG").and_then(|v| parse_bool(&v)) {
            self.debug = v;
        }
        if let Some(v) = lookup("BORGBOI_AWS__DYNAMODB_REPOS_TABLE") {
            self.aws.dynamodb_repos_table = v;
        }
        if let Some(v) = lookup("BORGBOI_AWS__S3_BUCKET") {
            self.aws.s3_bucket = v;
        }
        if let Some(v) = lookup("BORGBOI_AWS__REGION") {
            self.aws.region = v;
        }
        if let Some(v) = lookup("BORGBOI_AWS__PROFILE") {
            self.aws.profile = Some(v);
        }
        if let Some(v) = lookup("BORGBOI_AWS__ENDPOINT_URL") {
            self.aws.endpoint_url = Some(v);
        }
        if let Some(v) = lookup("BORGBOI_BORG__EXECUTABLE_PATH") {
            self.borg.executable_path = v;
        }
        if let Some(v) = lookup("BORGBOI_BORG__COMPRESSION") {
            self.borg.compression = v;
        }
        if let Some(v) = lookup("BORGBOI_BORG__BORG_PASSPHRASE") {
            self.borg.borg_passphrase = Some(v);
        }
        if let Some(v) = lookup("BORGBOI_BORG__BORG_NEW_PASSPHRASE") {
            self.borg.borg_new_passphrase = Some(v);
        }

        let retention = &mut self.borg.retention;
        for (key, slot) in [
            ("BORGBOI_BORG__RETENTION__KEEP_DAILY", &mut retention.keep_daily),
            ("BORGBOI_BORG__RETENTION__KEEP_WEEKLY", &mut retention.keep_weekly),
            ("BORGBOI_BORG__RETENTION__KEEP_MONTHLY", &mut retention.keep_monthly),
            ("BORGBOI_BORG__RETENTION__KEEP_YEARLY", &mut retention.keep_yearly),
        ] {
            match lookup(key).map(|v| v.trim().parse::<u32>()) {
                Some(Ok(v)) => *slot = v,
                Some(Err(_)) => debug!(key, "ignoring non-numeric retention override"),
                None => {}
            }
        }
    }

    /// Returns human-readable warnings about settings that will make operations fail.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.offline {
            if self.aws.s3_bucket.is_empty() {
                warnings.push("AWS S3 bucket not configured. S3 sync operations will fail.".to_owned());
            }
            if self.aws.dynamodb_repos_table.is_empty() {
                warnings.push(
                    "AWS DynamoDB repos table not configured. Repository tracking will fail.".to_owned(),
                );
            }
        }

        let base = self
            .borg
            .compression
            .split(',')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !VALID_COMPRESSION.contains(&base.as_str()) {
            warnings.push(format!(
                "Invalid compression format '{}'. Valid formats: {}",
                self.borg.compression,
                VALID_COMPRESSION.join(", ")
            ));
        }

        let r = &self.borg.retention;
        if [r.keep_daily, r.keep_weekly, r.keep_monthly, r.keep_yearly].iter().all(|v| *v == 0) {
            warnings.push(
                "No retention policy configured. All archives will be kept which may consume excessive storage."
                    .to_owned(),
            );
        }

        warnings
    }
}

/// Loads an explicit config file. A missing file is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        StorageError::with_source("load_config", format!("reading config file {}", path.display()), e)
    })?;
    let mut cfg: Config = toml::from_str(&contents).map_err(|e| {
        StorageError::with_source("load_config", format!("parsing config file {}", path.display()), e)
    })?;
    cfg.apply_env_overrides();
    Ok(cfg)
}

/// Loads `<borgboi_dir>/config.toml` when present, otherwise defaults; env overrides apply either way.
pub fn load_default() -> Result<Config> {
    let path = Config::default().borgboi_dir().join(CONFIG_FILE_NAME);
    if path.is_file() {
        return load_config(&path);
    }
    let mut cfg = Config::default();
    cfg.apply_env_overrides();
    Ok(cfg)
}

/// Resolves the user home: `BORGBOI_HOME`, then the invoking user's home under sudo, then `HOME`.
pub fn resolve_home_dir_with(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(home) = lookup("BORGBOI_HOME").filter(|h| !h.is_empty()) {
        return PathBuf::from(home);
    }
    if let Some(user) = lookup("SUDO_USER").filter(|u| !u.is_empty()) {
        let sudo_home = if cfg!(target_os = "macos") {
            PathBuf::from("/Users").join(&user)
        } else {
            PathBuf::from("/home").join(&user)
        };
        if sudo_home.exists() {
            return sudo_home;
        }
    }
    lookup("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
