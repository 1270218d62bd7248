//! Field-by-field decoder for repository and S3-stats records written by other writers.
//!
//! Legacy JSON files, legacy SQLite rows and cloud table items are all reduced to a
//! JSON object and decoded here, independent of `Repository`'s own serde layout, so a
//! format change in the domain model never breaks reading old data.

use std::path::Path;

use borgboi_core::{timestamp, OsPlatform, RepoMetadata, Repository, RetentionPolicy, S3RepoStats};
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use tracing::warn;

/// Decodes one repository record. Errors are human-readable reasons for the migration report.
pub(crate) fn decode_repository(obj: &Map<String, Value>) -> Result<Repository, String> {
    let name = required_str(obj, &["name", "repo_name", "common_name"])?;
    let path = required_str(obj, &["path", "repo_path"])?;
    let hostname = required_str(obj, &["hostname"])?;
    let backup_target = required_str(obj, &["backup_target", "backup_target_path"])?;
    let os_platform = required_str(obj, &["os_platform"])?
        .parse::<OsPlatform>()
        .map_err(|e| e.to_string())?;

    let metadata = match obj.get("metadata").or_else(|| obj.get("metadata_json")) {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => decode_metadata(&name, serde_json::from_str(raw).ok()),
        Some(other) => decode_metadata(&name, Some(other.clone())),
    };

    Ok(Repository {
        last_backup: optional_ts(obj, "last_backup"),
        last_s3_sync: optional_ts(obj, "last_s3_sync"),
        created_at: optional_ts(obj, "created_at"),
        metadata,
        retention_policy: decode_retention(obj)?,
        passphrase: optional_str(obj, "passphrase"),
        passphrase_file_path: optional_str(obj, "passphrase_file_path"),
        passphrase_migrated: obj.get("passphrase_migrated").is_some_and(truthy),
        name,
        path,
        hostname,
        backup_target,
        os_platform,
    })
}

/// Decodes one cached S3 stats entry. `cached_at` is reset since the source is being replaced.
pub(crate) fn decode_s3_stats(obj: &Map<String, Value>) -> Result<S3RepoStats, String> {
    let total_size_bytes = optional_u64(obj, "total_size_bytes")?.unwrap_or(0);
    let object_count = optional_u64(obj, "object_count")?.unwrap_or(0);
    Ok(S3RepoStats {
        total_size_bytes,
        object_count,
        last_modified: optional_ts(obj, "last_modified"),
        cached_at: Utc::now(),
    })
}

/// Tables read out of a previous-generation single-file database.
pub(crate) struct LegacyDatabase {
    pub repositories: Vec<(String, Map<String, Value>)>,
    pub s3_stats: Vec<(String, Map<String, Value>)>,
}

pub(crate) fn read_legacy_database(path: &Path) -> rusqlite::Result<LegacyDatabase> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let repositories = if table_exists(&conn, "repositories")? {
        read_table(&conn, "repositories", "name")?
    } else {
        Vec::new()
    };
    let s3_stats = if table_exists(&conn, "s3_stats_cache")? {
        read_table(&conn, "s3_stats_cache", "repo_name")?
    } else {
        Vec::new()
    };
    Ok(LegacyDatabase {
        repositories,
        s3_stats,
    })
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Reads every row as a column-name keyed object, labelled by `id_column` (or the row number).
fn read_table(
    conn: &Connection,
    table: &str,
    id_column: &str,
) -> rusqlite::Result<Vec<(String, Map<String, Value>)>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table}"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    let mut n = 0usize;
    while let Some(row) = rows.next()? {
        n += 1;
        let mut obj = Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::from(v),
                ValueRef::Real(v) => Value::from(v),
                ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            };
            obj.insert(column.clone(), value);
        }
        let label = obj
            .get(id_column)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{table} row {n}"));
        out.push((label, obj));
    }
    Ok(out)
}

fn required_str(obj: &Map<String, Value>, keys: &[&str]) -> Result<String, String> {
    for key in keys {
        match obj.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Ok(s.clone()),
            Some(Value::Null) | None => continue,
            Some(Value::String(_)) => return Err(format!("field '{key}' is empty")),
            Some(_) => return Err(format!("field '{key}' is not a string")),
        }
    }
    Err(format!("missing required field '{}'", keys[0]))
}

fn optional_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn optional_ts(obj: &Map<String, Value>, key: &str) -> Option<chrono::DateTime<Utc>> {
    obj.get(key).and_then(Value::as_str).and_then(timestamp::parse)
}

fn optional_u64(obj: &Map<String, Value>, key: &str) -> Result<Option<u64>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| format!("field '{key}' is not a non-negative number")),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn decode_retention(obj: &Map<String, Value>) -> Result<Option<RetentionPolicy>, String> {
    if let Some(Value::Object(policy)) = obj.get("retention_policy") {
        return serde_json::from_value(Value::Object(policy.clone()))
            .map(Some)
            .map_err(|e| format!("invalid retention_policy: {e}"));
    }

    let column = |suffix: &str| -> Result<Option<u32>, String> {
        let key = format!("retention_keep_{suffix}");
        match optional_u64(obj, &key)? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| format!("field '{key}' is out of range: {v}")),
        }
    };
    let (daily, weekly, monthly, yearly) =
        (column("daily")?, column("weekly")?, column("monthly")?, column("yearly")?);
    if daily.is_none() && weekly.is_none() && monthly.is_none() && yearly.is_none() {
        return Ok(None);
    }
    let defaults = RetentionPolicy::default();
    Ok(Some(RetentionPolicy {
        keep_daily: daily.unwrap_or(defaults.keep_daily),
        keep_weekly: weekly.unwrap_or(defaults.keep_weekly),
        keep_monthly: monthly.unwrap_or(defaults.keep_monthly),
        keep_yearly: yearly.unwrap_or(defaults.keep_yearly),
    }))
}

fn decode_metadata(name: &str, raw: Option<Value>) -> Option<RepoMetadata> {
    let raw = raw?;
    match serde_json::from_value(raw) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(repo = %name, error = %e, "dropping unreadable borg metadata");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn decodes_minimal_json_record() {
        let repo = decode_repository(&obj(json!({
            "path": "/repos/test",
            "backup_target": "/home/user",
            "name": "test-repo",
            "hostname": "localhost",
            "os_platform": "Darwin",
            "metadata": null,
            "passphrase": "inline",
            "passphrase_migrated": false
        })))
        .unwrap();
        assert_eq!(repo.name, "test-repo");
        assert_eq!(repo.os_platform, OsPlatform::Darwin);
        assert_eq!(repo.passphrase.as_deref(), Some("inline"));
        assert!(repo.retention_policy.is_none());
    }

    #[test]
    fn decodes_sqlite_row_shape() {
        let repo = decode_repository(&obj(json!({
            "id": 3,
            "name": "row-repo",
            "path": "/r",
            "backup_target": "/t",
            "hostname": "h",
            "os_platform": "Linux",
            "last_backup": "2025-05-01 08:00:00.000000",
            "metadata_json": "{not json",
            "retention_keep_daily": 3,
            "passphrase_migrated": 1
        })))
        .unwrap();
        assert!(repo.passphrase_migrated);
        assert!(repo.metadata.is_none());
        assert_eq!(repo.retention_policy.unwrap().keep_daily, 3);
        assert_eq!(repo.retention_policy.unwrap().keep_weekly, 4);
        assert!(repo.last_backup.is_some());
    }

    #[test]
    fn accepts_cloud_era_aliases() {
        let repo = decode_repository(&obj(json!({
            "repo_path": "/r",
            "common_name": "aliased",
            "backup_target_path": "/t",
            "hostname": "h",
            "os_platform": "Linux"
        })))
        .unwrap();
        assert_eq!(repo.name, "aliased");
        assert_eq!(repo.path, "/r");
    }

    #[test]
    fn reports_missing_and_invalid_fields() {
        let err = decode_repository(&obj(json!({"name": "x"}))).unwrap_err();
        assert!(err.contains("path"));

        let err = decode_repository(&obj(json!({
            "name": "x", "path": "/p", "hostname": "h", "backup_target": "/t", "os_platform": "BeOS"
        })))
        .unwrap_err();
        assert!(err.contains("BeOS"));
    }

    #[test]
    fn oversized_retention_columns_fail_the_record() {
        let err = decode_repository(&obj(json!({
            "name": "big", "path": "/p", "hostname": "h", "backup_target": "/t",
            "os_platform": "Linux", "retention_keep_daily": 4_294_967_296u64
        })))
        .unwrap_err();
        assert!(err.contains("retention_keep_daily"), "{err}");

        let err = decode_repository(&obj(json!({
            "name": "neg", "path": "/p", "hostname": "h", "backup_target": "/t",
            "os_platform": "Linux", "retention_policy": {"keep_daily": -1}
        })))
        .unwrap_err();
        assert!(err.contains("retention_policy"), "{err}");
    }

    #[test]
    fn decodes_s3_stats_with_defaults() {
        let stats = decode_s3_stats(&obj(json!({"total_size_bytes": 1024}))).unwrap();
        assert_eq!(stats.total_size_bytes, 1024);
        assert_eq!(stats.object_count, 0);
        assert!(decode_s3_stats(&obj(json!({"object_count": "many"}))).is_err());
    }
}
