use std::collections::BTreeMap;
use std::sync::Mutex;

use borgboi_core::{Result, StorageError};
use serde_json::{Map, Value};

/// One table item, attribute name to value.
pub type Item = Map<String, Value>;

/// Key-value table keyed by `(path, hostname)` with a secondary index on `name`.
///
/// Every call is a single request against the table; callers compose them.
pub trait RepoTable: Send + Sync {
    /// Full-item put, replacing any item with the same key.
    fn put_item(&self, item: Item) -> Result<()>;

    fn get_item(&self, path: &str, hostname: &str) -> Result<Option<Item>>;

    /// Every item stored under `path`, across hosts.
    fn query_path(&self, path: &str) -> Result<Vec<Item>>;

    /// Items whose `name` attribute equals `name`, via the secondary index.
    fn query_name(&self, name: &str) -> Result<Vec<Item>>;

    fn scan(&self) -> Result<Vec<Item>>;

    /// Returns `false` when no item existed under the key.
    fn delete_item(&self, path: &str, hostname: &str) -> Result<bool>;
}

/// Path and hostname of an item, accepting the attribute names used by older writers.
pub fn item_key(item: &Item) -> Option<(String, String)> {
    let path = item
        .get("path")
        .or_else(|| item.get("repo_path"))
        .and_then(Value::as_str)?;
    let hostname = item.get("hostname").and_then(Value::as_str)?;
    Some((path.to_owned(), hostname.to_owned()))
}

/// In-process table with the same key and index semantics as the remote one.
#[derive(Debug, Default)]
pub struct MemoryRepoTable {
    items: Mutex<BTreeMap<(String, String), Item>>,
}

impl MemoryRepoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Item>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RepoTable for MemoryRepoTable {
    fn put_item(&self, item: Item) -> Result<()> {
        let key = item_key(&item).ok_or_else(|| {
            StorageError::validation("item is missing its path or hostname key attribute")
        })?;
        self.lock().insert(key, item);
        Ok(())
    }

    fn get_item(&self, path: &str, hostname: &str) -> Result<Option<Item>> {
        Ok(self.lock().get(&(path.to_owned(), hostname.to_owned())).cloned())
    }

    fn query_path(&self, path: &str) -> Result<Vec<Item>> {
        Ok(self
            .lock()
            .iter()
            .filter(|((p, _), _)| p == path)
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn query_name(&self, name: &str) -> Result<Vec<Item>> {
        Ok(self
            .lock()
            .values()
            .filter(|item| item.get("name").and_then(Value::as_str) == Some(name))
            .cloned()
            .collect())
    }

    fn scan(&self) -> Result<Vec<Item>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn delete_item(&self, path: &str, hostname: &str) -> Result<bool> {
        Ok(self
            .lock()
            .remove(&(path.to_owned(), hostname.to_owned()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn item(v: Value) -> Item {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn memory_table_keys_on_path_and_hostname() {
        let table = MemoryRepoTable::new();
        table
            .put_item(item(json!({"path": "/r", "hostname": "a", "name": "one"})))
            .unwrap();
        table
            .put_item(item(json!({"path": "/r", "hostname": "b", "name": "two"})))
            .unwrap();
        table
            .put_item(item(json!({"path": "/r", "hostname": "a", "name": "one-renamed"})))
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.query_path("/r").unwrap().len(), 2);
        assert!(table.query_name("one").unwrap().is_empty());
        assert_eq!(table.query_name("one-renamed").unwrap().len(), 1);
        assert!(table.delete_item("/r", "b").unwrap());
        assert!(!table.delete_item("/r", "b").unwrap());
    }

    #[test]
    fn item_key_accepts_old_attribute_names() {
        let key = item_key(&item(json!({"repo_path": "/old", "hostname": "h"})));
        assert_eq!(key, Some(("/old".to_owned(), "h".to_owned())));
        assert!(item_key(&item(json!({"path": "/x"}))).is_none());
        assert!(MemoryRepoTable::new()
            .put_item(item(json!({"name": "keyless"})))
            .is_err());
    }
}
