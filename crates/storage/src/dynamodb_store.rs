use std::collections::HashMap;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use borgboi_core::config::AwsConfig;
use borgboi_core::{timestamp, Config, Repository, Result, StorageError};
use serde_json::{Number, Value};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::decode::decode_repository;
use crate::store::{pick_path_match, RepositoryStorage};
use crate::table::{item_key, Item, RepoTable};

/// Repository metadata in a shared DynamoDB table.
///
/// Items are keyed by `(path, hostname)`; `name` is served by a secondary index.
/// The deprecated inline passphrase is never written to the table.
pub struct DynamoDbStore<T: RepoTable = AwsRepoTable> {
    table: T,
}

impl DynamoDbStore<AwsRepoTable> {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(AwsRepoTable::from_config(&config.aws)?))
    }
}

impl<T: RepoTable> DynamoDbStore<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    /// Deletes the item stored under `(path, hostname)` directly.
    pub fn delete_by_path(&self, path: &str, hostname: &str) -> Result<()> {
        if self.table.delete_item(path, hostname)? {
            Ok(())
        } else {
            Err(StorageError::not_found_path(path))
        }
    }
}

impl<T: RepoTable> RepositoryStorage for DynamoDbStore<T> {
    fn get(&self, name: &str) -> Result<Repository> {
        let items = self.table.query_name(name)?;
        if items.len() > 1 {
            warn!(repo = %name, count = items.len(), "name index returned several items, using the first");
        }
        match items.first() {
            Some(item) => from_item(item),
            None => Err(StorageError::not_found_name(name)),
        }
    }

    fn get_by_path(&self, path: &str, hostname: Option<&str>) -> Result<Repository> {
        if let Some(host) = hostname {
            return match self.table.get_item(path, host)? {
                Some(item) => from_item(&item),
                None => Err(StorageError::not_found_path(path)),
            };
        }

        let matches = self
            .table
            .query_path(path)?
            .iter()
            .filter_map(|item| match from_item(item) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping malformed table item");
                    None
                }
            })
            .collect();
        pick_path_match(path, None, matches)
    }

    fn list_all(&self) -> Result<Vec<Repository>> {
        let items = self.table.scan()?;
        let total = items.len();
        let repos: Vec<Repository> = items
            .iter()
            .filter_map(|item| match from_item(item) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!(key = ?item_key(item), error = %e, "skipping malformed table item");
                    None
                }
            })
            .collect();
        if repos.len() < total {
            warn!(skipped = total - repos.len(), "some table items could not be read");
        }
        Ok(repos)
    }

    fn save(&self, repo: &Repository) -> Result<()> {
        repo.validate()?;

        if let Some(existing) = self.table.get_item(&repo.path, &repo.hostname)? {
            let owner = item_name(&existing);
            if owner.is_some_and(|owner| owner != repo.name) {
                return Err(StorageError::invalid_field(
                    "path",
                    format!(
                        "path '{}' on host '{}' is already registered as '{}'",
                        repo.path,
                        repo.hostname,
                        owner.unwrap_or_default()
                    ),
                ));
            }
        }

        let key = (repo.path.clone(), repo.hostname.clone());
        let stale: Vec<(String, String)> = self
            .table
            .query_name(&repo.name)?
            .iter()
            .filter_map(item_key)
            .filter(|k| *k != key)
            .collect();

        self.table.put_item(to_item(repo)?)?;
        for (path, hostname) in stale {
            debug!(repo = %repo.name, old_path = %path, old_host = %hostname, "removing item at previous key");
            self.table.delete_item(&path, &hostname)?;
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let items = self.table.query_name(name)?;
        let Some(item) = items.first() else {
            return Err(StorageError::not_found_name(name));
        };
        let (path, hostname) = item_key(item).ok_or_else(|| {
            StorageError::storage("delete", format!("item for '{name}' has no key attributes"))
        })?;
        if self.table.delete_item(&path, &hostname)? {
            Ok(())
        } else {
            Err(StorageError::not_found_name(name))
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(!self.table.query_name(name)?.is_empty())
    }
}

fn item_name(item: &Item) -> Option<&str> {
    ["name", "common_name", "repo_name"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
}

fn from_item(item: &Item) -> Result<Repository> {
    decode_repository(item).map_err(|reason| StorageError::storage("decode_item", reason))
}

fn to_item(repo: &Repository) -> Result<Item> {
    let mut item = Item::new();
    item.insert("path".into(), Value::from(repo.path.as_str()));
    item.insert("hostname".into(), Value::from(repo.hostname.as_str()));
    item.insert("name".into(), Value::from(repo.name.as_str()));
    item.insert("backup_target".into(), Value::from(repo.backup_target.as_str()));
    item.insert("os_platform".into(), Value::from(repo.os_platform.as_str()));

    for (attr, ts) in [
        ("last_backup", &repo.last_backup),
        ("last_s3_sync", &repo.last_s3_sync),
        ("created_at", &repo.created_at),
    ] {
        if let Some(ts) = ts {
            item.insert(attr.into(), Value::from(timestamp::format(ts)));
        }
    }
    if let Some(metadata) = &repo.metadata {
        let value = serde_json::to_value(metadata)
            .map_err(|e| StorageError::with_source("save", "serialize metadata", e))?;
        item.insert("metadata".into(), value);
    }
    if let Some(policy) = repo.retention_policy {
        item.insert("retention_keep_daily".into(), Value::from(policy.keep_daily));
        item.insert("retention_keep_weekly".into(), Value::from(policy.keep_weekly));
        item.insert("retention_keep_monthly".into(), Value::from(policy.keep_monthly));
        item.insert("retention_keep_yearly".into(), Value::from(policy.keep_yearly));
    }
    if let Some(file) = &repo.passphrase_file_path {
        item.insert("passphrase_file_path".into(), Value::from(file.as_str()));
    }
    item.insert("passphrase_migrated".into(), Value::Bool(repo.passphrase_migrated));
    Ok(item)
}

/// `RepoTable` over the AWS SDK. Requests are driven on an owned current-thread runtime,
/// so this must not be called from inside another tokio runtime.
pub struct AwsRepoTable {
    client: Client,
    table_name: String,
    name_index: String,
    runtime: Runtime,
}

impl AwsRepoTable {
    pub fn from_config(aws: &AwsConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::with_source("init", "start tokio runtime", e))?;

        let region = Region::new(aws.region.clone());
        let profile = aws.profile.clone();
        let sdk_config = runtime.block_on(async move {
            let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
            if let Some(profile) = profile {
                loader = loader.profile_name(profile);
            }
            loader.load().await
        });

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&sdk_config);
        if let Some(url) = &aws.endpoint_url {
            builder = builder.endpoint_url(url);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            table_name: aws.dynamodb_repos_table.clone(),
            name_index: aws.dynamodb_name_index.clone(),
            runtime,
        })
    }

    fn key(path: &str, hostname: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("path".to_owned(), AttributeValue::S(path.to_owned())),
            ("hostname".to_owned(), AttributeValue::S(hostname.to_owned())),
        ])
    }

    fn query(&self, operation: &'static str, index: Option<&str>, attr: &str, value: &str) -> Result<Vec<Item>> {
        self.runtime.block_on(async {
            let mut items = Vec::new();
            let mut start_key = None;
            loop {
                let output = self
                    .client
                    .query()
                    .table_name(&self.table_name)
                    .set_index_name(index.map(str::to_owned))
                    .key_condition_expression("#k = :v")
                    .expression_attribute_names("#k", attr)
                    .expression_attribute_values(":v", AttributeValue::S(value.to_owned()))
                    .set_exclusive_start_key(start_key)
                    .send()
                    .await
                    .map_err(|e| sdk_error(operation, e))?;
                items.extend(output.items().iter().map(from_attributes));
                match output.last_evaluated_key() {
                    Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                    _ => break,
                }
            }
            Ok::<_, StorageError>(items)
        })
    }
}

impl RepoTable for AwsRepoTable {
    fn put_item(&self, item: Item) -> Result<()> {
        let attributes = to_attributes(&item);
        self.runtime.block_on(async {
            self.client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(attributes))
                .send()
                .await
                .map_err(|e| sdk_error("save", e))?;
            Ok::<_, StorageError>(())
        })
    }

    fn get_item(&self, path: &str, hostname: &str) -> Result<Option<Item>> {
        self.runtime.block_on(async {
            let output = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .set_key(Some(Self::key(path, hostname)))
                .send()
                .await
                .map_err(|e| sdk_error("get_by_path", e))?;
            Ok::<_, StorageError>(output.item().map(from_attributes))
        })
    }

    fn query_path(&self, path: &str) -> Result<Vec<Item>> {
        self.query("get_by_path", None, "path", path)
    }

    fn query_name(&self, name: &str) -> Result<Vec<Item>> {
        self.query("get", Some(&self.name_index), "name", name)
    }

    fn scan(&self) -> Result<Vec<Item>> {
        self.runtime.block_on(async {
            let mut items = Vec::new();
            let mut start_key = None;
            loop {
                let output = self
                    .client
                    .scan()
                    .table_name(&self.table_name)
                    .set_exclusive_start_key(start_key)
                    .send()
                    .await
                    .map_err(|e| sdk_error("list_all", e))?;
                items.extend(output.items().iter().map(from_attributes));
                match output.last_evaluated_key() {
                    Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                    _ => break,
                }
            }
            Ok::<_, StorageError>(items)
        })
    }

    fn delete_item(&self, path: &str, hostname: &str) -> Result<bool> {
        self.runtime.block_on(async {
            let result = self
                .client
                .delete_item()
                .table_name(&self.table_name)
                .set_key(Some(Self::key(path, hostname)))
                .condition_expression("attribute_exists(#p)")
                .expression_attribute_names("#p", "path")
                .send()
                .await;
            match result {
                Ok(_) => Ok(true),
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
                {
                    Ok(false)
                }
                Err(e) => Err(sdk_error("delete", e)),
            }
        })
    }
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("DynamoDB request failed: {}", DisplayErrorContext(&err));
    StorageError::with_source(operation, message, err)
}

fn to_attributes(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect(),
        ),
    }
}

fn from_attributes(attributes: &HashMap<String, AttributeValue>) -> Item {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), from_attribute(v)))
        .collect()
}

fn from_attribute(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(values) => Value::Array(values.iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Object(from_attributes(map)),
        AttributeValue::Ss(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(values) => Value::Array(values.iter().map(|n| number(n)).collect()),
        _ => Value::Null,
    }
}

fn number(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        return Value::from(v);
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Value::from(v);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_owned()))
}
