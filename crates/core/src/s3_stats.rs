use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = BYTES_PER_KB * 1024;
const BYTES_PER_GB: u64 = BYTES_PER_MB * 1024;

/// Cached S3 usage for one repository. Never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3RepoStats {
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub object_count: u64,
    #[serde(default, with = "crate::timestamp::option")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now", with = "crate::timestamp::or_now")]
    pub cached_at: DateTime<Utc>,
}

impl S3RepoStats {
    pub fn new(total_size_bytes: u64, object_count: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            total_size_bytes,
            object_count,
            last_modified,
            cached_at: Utc::now(),
        }
    }

    pub fn total_size_gb(&self) -> f64 {
        self.total_size_bytes as f64 / BYTES_PER_GB as f64
    }

    pub fn total_size_formatted(&self) -> String {
        let bytes = self.total_size_bytes;
        if bytes < BYTES_PER_KB {
            format!("{bytes} B")
        } else if bytes < BYTES_PER_MB {
            format!("{:.1} KB", bytes as f64 / BYTES_PER_KB as f64)
        } else if bytes < BYTES_PER_GB {
            format!("{:.1} MB", bytes as f64 / BYTES_PER_MB as f64)
        } else {
            format!("{:.2} GB", self.total_size_gb())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes_by_magnitude() {
        assert_eq!(S3RepoStats::new(512, 1, None).total_size_formatted(), "512 B");
        assert_eq!(S3RepoStats::new(2048, 1, None).total_size_formatted(), "2.0 KB");
        assert_eq!(
            S3RepoStats::new(5 * BYTES_PER_MB, 1, None).total_size_formatted(),
            "5.0 MB"
        );
        assert_eq!(
            S3RepoStats::new(3 * BYTES_PER_GB, 1, None).total_size_formatted(),
            "3.00 GB"
        );
    }

    #[test]
    fn missing_fields_take_defaults() {
        let stats: S3RepoStats = serde_json::from_str(r#"{"total_size_bytes": 10}"#).unwrap();
        assert_eq!(stats.total_size_bytes, 10);
        assert_eq!(stats.object_count, 0);
        assert!(stats.last_modified.is_none());
    }
}
