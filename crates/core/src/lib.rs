pub mod config;
pub mod error;
pub mod repository;
pub mod s3_stats;
pub mod timestamp;

pub use config::Config;
pub use error::{Result, StorageError};
pub use repository::{
    OsPlatform, RepoCache, RepoEncryption, RepoLocation, RepoMetadata, RepoStats, Repository,
    RetentionPolicy,
};
pub use s3_stats::S3RepoStats;
