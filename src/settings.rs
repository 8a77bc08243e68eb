//! Layered key/value settings over TOML
//!
//! Three layers are merged on every read, highest first:
//!
//! 1. explicit `set` calls
//! 2. documents loaded with `read` / `read_file`
//! 3. `set_default` values
//!
//! Keys are dotted paths into nested tables (`group.channel_capacity`).
//! The merged view can be marshalled back to TOML or decoded into any
//! `serde` type, which is how `config::AppConfig` is loaded.

use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use serde::de::DeserializeOwned;
use toml::{Table, Value};
use tracing::debug;

use crate::kafka::error::{KafkaError, Result};

/// Layered settings store
#[derive(Default)]
pub struct SettingsStore {
    defaults: Table,
    file: Table,
    overrides: Table,
    cache: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, overriding file contents and defaults
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        insert_path(&mut self.overrides, key, value.into())
    }

    /// Set the fallback for a key
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        insert_path(&mut self.defaults, key, value.into())
    }

    /// Merged value for a dotted key
    pub fn get(&self, key: &str) -> Option<Value> {
        [&self.overrides, &self.file, &self.defaults]
            .into_iter()
            .filter_map(|layer| lookup_path(layer, key))
            .fold(None, |acc: Option<Value>, found| match (acc, found) {
                // lower layers only fill in missing table entries
                (Some(Value::Table(mut upper)), Value::Table(lower)) => {
                    merge_into(&mut upper, &lower, false);
                    Some(Value::Table(upper))
                }
                (Some(upper), _) => Some(upper),
                (None, found) => Some(found.clone()),
            })
    }

    /// Merged value decoded into `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|v| {
                v.try_into()
                    .map_err(|e| KafkaError::Config(format!("setting '{}': {}", key, e)))
            })
            .transpose()
    }

    /// Sorted dotted paths of every leaf in the merged view
    pub fn list(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_leaves(&self.merged(), "", &mut keys);
        keys.sort();
        keys
    }

    /// Remove `key` from the table at `parent` in the file and explicit
    /// layers; defaults are kept. Returns whether anything was removed.
    pub fn unset(&mut self, parent: &str, key: &str) -> bool {
        let path = if parent.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", parent, key)
        };
        let a = remove_path(&mut self.overrides, &path);
        let b = remove_path(&mut self.file, &path);
        a || b
    }

    /// Remove several dotted keys; returns how many were present
    pub fn delete(&mut self, keys: &[&str]) -> usize {
        keys.iter()
            .filter(|key| {
                let a = remove_path(&mut self.overrides, key);
                let b = remove_path(&mut self.file, key);
                a || b
            })
            .count()
    }

    /// Drop file contents, explicit values and the typed cache
    pub fn reset(&mut self) {
        self.file.clear();
        self.overrides.clear();
        self.cache.clear();
    }

    /// Merge a TOML document into the file layer
    pub fn read(&mut self, document: &str) -> Result<()> {
        let table: Table = document
            .parse()
            .map_err(|e| KafkaError::Config(format!("invalid TOML: {}", e)))?;
        merge_into(&mut self.file, &table, true);
        Ok(())
    }

    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        let document = fs::read_to_string(path)?;
        debug!(path = %path.display(), "loaded settings file");
        self.read(&document)
    }

    /// Write the merged view to `path`, creating it if needed
    pub fn write(&self, path: &Path) -> Result<()> {
        ensure_file(path, 0o600)?;
        fs::write(path, self.marshal()?)?;
        Ok(())
    }

    /// Merged view as a TOML document
    pub fn marshal(&self) -> Result<String> {
        toml::to_string(&self.merged())
            .map_err(|e| KafkaError::Config(format!("cannot encode settings: {}", e)))
    }

    /// Decode the merged view into `T`
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        Value::Table(self.merged())
            .try_into()
            .map_err(|e| KafkaError::Config(format!("cannot decode settings: {}", e)))
    }

    /// Cache a typed value under `key`
    pub fn store<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.cache.insert(key.to_string(), Box::new(value));
    }

    /// Typed value previously cached under `key`
    pub fn load<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.cache
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    fn merged(&self) -> Table {
        let mut merged = self.defaults.clone();
        merge_into(&mut merged, &self.file, true);
        merge_into(&mut merged, &self.overrides, true);
        merged
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("keys", &self.list())
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Create `path` (and its parent directories) as an empty file with the
/// given permission bits, if it does not exist yet
///
/// Returns `true` when the file was created.
pub fn ensure_file(path: &Path, mode: u32) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    match options.open(path) {
        Ok(_) => {
            debug!(path = %path.display(), "created file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn split_key(key: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(KafkaError::Config(format!("invalid settings key '{}'", key)));
    }
    Ok(parts)
}

fn insert_path(table: &mut Table, key: &str, value: Value) -> Result<()> {
    let parts = split_key(key)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| KafkaError::Config("empty settings key".into()))?;

    let mut current = table;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        current = match entry {
            Value::Table(t) => t,
            _ => {
                return Err(KafkaError::Config(format!(
                    "settings key '{}' crosses a non-table value",
                    key
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn lookup_path<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut value = table.get(parts.next()?)?;
    for part in parts {
        value = value.as_table()?.get(part)?;
    }
    Some(value)
}

fn remove_path(table: &mut Table, key: &str) -> bool {
    match key.split_once('.') {
        None => table.remove(key).is_some(),
        Some((head, rest)) => match table.get_mut(head) {
            Some(Value::Table(child)) => remove_path(child, rest),
            _ => false,
        },
    }
}

/// Merge `src` into `dst`. Nested tables merge recursively; other values
/// replace existing ones only when `overwrite` is set.
fn merge_into(dst: &mut Table, src: &Table, overwrite: bool) {
    for (key, value) in src {
        match (dst.get_mut(key), value) {
            (Some(Value::Table(d)), Value::Table(s)) => merge_into(d, s, overwrite),
            (Some(_), _) if !overwrite => {}
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

fn collect_leaves(table: &Table, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Table(child) => collect_leaves(child, &path, out),
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_layer_precedence() {
        let mut store = SettingsStore::new();
        store.set_default("log.level", "info").unwrap();
        assert_eq!(store.get("log.level"), Some(Value::from("info")));

        store.read("[log]\nlevel = \"warn\"").unwrap();
        assert_eq!(store.get("log.level"), Some(Value::from("warn")));

        store.set("log.level", "debug").unwrap();
        assert_eq!(store.get("log.level"), Some(Value::from("debug")));
    }

    #[test]
    fn test_get_merges_tables_across_layers() {
        let mut store = SettingsStore::new();
        store.set_default("group.claim_buffer", 8i64).unwrap();
        store.set("group.channel_capacity", 4i64).unwrap();

        let group = store.get("group").unwrap();
        let group = group.as_table().unwrap();
        assert_eq!(group.get("claim_buffer"), Some(&Value::from(8i64)));
        assert_eq!(group.get("channel_capacity"), Some(&Value::from(4i64)));
    }

    #[test]
    fn test_get_as() {
        let mut store = SettingsStore::new();
        store.set("kafka.brokers", vec!["a:1", "b:2"]).unwrap();
        let brokers: Vec<String> = store.get_as("kafka.brokers").unwrap().unwrap();
        assert_eq!(brokers, vec!["a:1", "b:2"]);
        assert!(store.get_as::<i64>("kafka.brokers").is_err());
        assert!(store.get_as::<i64>("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_is_sorted_leaves() {
        let mut store = SettingsStore::new();
        store.set("b.y", 1i64).unwrap();
        store.set("a", true).unwrap();
        store.set_default("b.x", 2i64).unwrap();
        assert_eq!(store.list(), vec!["a", "b.x", "b.y"]);
    }

    #[test]
    fn test_unset_and_delete() {
        let mut store = SettingsStore::new();
        store.set_default("kafka.username", "default-user").unwrap();
        store.read("[kafka]\nusername = \"file-user\"\npassword = \"pw\"").unwrap();
        store.set("kafka.username", "cli-user").unwrap();

        assert!(store.unset("kafka", "username"));
        // defaults survive unset
        assert_eq!(store.get("kafka.username"), Some(Value::from("default-user")));
        assert!(!store.unset("kafka", "username"));

        assert_eq!(store.delete(&["kafka.password", "kafka.nope"]), 1);
        assert!(store.get("kafka.password").is_none());
    }

    #[test]
    fn test_reset_clears_everything_but_defaults() {
        let mut store = SettingsStore::new();
        store.set_default("x", 1i64).unwrap();
        store.set("x", 2i64).unwrap();
        store.store("typed", 7u32);
        store.reset();
        assert_eq!(store.get("x"), Some(Value::from(1i64)));
        assert_eq!(store.load::<u32>("typed"), None);
    }

    #[test]
    fn test_marshal_unmarshal() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Section {
            name: String,
            count: i64,
        }
        #[derive(Debug, Deserialize, PartialEq)]
        struct Doc {
            section: Section,
        }

        let mut store = SettingsStore::new();
        store.set("section.name", "orders").unwrap();
        store.set("section.count", 3i64).unwrap();

        let text = store.marshal().unwrap();
        let mut reread = SettingsStore::new();
        reread.read(&text).unwrap();

        let doc: Doc = reread.unmarshal().unwrap();
        assert_eq!(
            doc,
            Doc {
                section: Section {
                    name: "orders".into(),
                    count: 3
                }
            }
        );
    }

    #[test]
    fn test_typed_cache() {
        let mut store = SettingsStore::new();
        store.store("ids", vec![1, 2, 3]);
        assert_eq!(store.load::<Vec<i32>>("ids"), Some(vec![1, 2, 3]));
        assert_eq!(store.load::<String>("ids"), None);
    }

    #[test]
    fn test_invalid_input() {
        let mut store = SettingsStore::new();
        assert!(store.set("a..b", 1i64).is_err());
        assert!(store.read("this is = = not toml").is_err());
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conduit.toml");

        let mut store = SettingsStore::new();
        store.set("log.level", "warn").unwrap();
        store.write(&path).unwrap();

        let mut reread = SettingsStore::new();
        reread.read_file(&path).unwrap();
        assert_eq!(reread.get("log.level"), Some(Value::from("warn")));
    }

    #[test]
    fn test_ensure_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("empty.toml");

        assert!(ensure_file(&path, 0o640).unwrap());
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!ensure_file(&path, 0o640).unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            // umask may clear bits but never adds any
            assert_eq!(mode & !0o640, 0);
        }
    }
}
