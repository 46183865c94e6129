//! Persistent document store backed by the redb embedded database.
//!
//! All documents share one table under namespaced `collection:key` keys;
//! values are JSON blobs. Generated-data keys embed an inverted timestamp
//! so a prefix scan yields records newest first without a secondary index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ::redb::{Database, TableDefinition};
use tokio::sync::broadcast;

use crate::documents::{apply_patch, DeviceDocument, GeneratedData, RuleDocument};
use crate::{ChangeKind, DocumentStore, Error, Result, RuleChange};

const UNIFIED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

const DEVICES: &str = "devices";
const RULES: &str = "rules";
const GENERATED: &str = "generated";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

fn make_key(collection: &str, key: &str) -> String {
    let mut result = String::with_capacity(collection.len() + key.len() + 1);
    result.push_str(collection);
    result.push(':');
    result.push_str(key);
    result
}

/// Generated-data key: newest records sort first under an ascending scan.
fn generated_key(device_id: &str, record: &GeneratedData) -> String {
    let millis = record.creation_timestamp.timestamp_millis().max(0) as u64;
    format!(
        "{}:{:020}:{}",
        device_id,
        u64::MAX - millis,
        uuid::Uuid::new_v4().simple()
    )
}

/// redb-backed document store.
pub struct RedbStore {
    db: Arc<Database>,
    path: String,
    /// Actual file path for `:memory:` databases (removed on drop).
    temp_path: Option<PathBuf>,
    changes: broadcast::Sender<RuleChange>,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };
        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_string_lossy().to_string(),
            temp_path: None,
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        })
    }

    /// Store backed by a throwaway file in the system temp directory.
    /// redb has no true in-memory mode.
    pub fn ephemeral() -> Result<Self> {
        let temp_path = std::env::temp_dir().join(format!("rulevm_{}.redb", uuid::Uuid::new_v4()));
        let db = Database::create(&temp_path)?;
        Ok(Self {
            db: Arc::new(db),
            path: ":memory:".to_string(),
            temp_path: Some(temp_path),
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        })
    }

    /// The storage path (`:memory:` for ephemeral stores).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn write_blob(&self, collection: &str, key: &str, value: &[u8]) -> Result<()> {
        let namespaced = make_key(collection, key);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            table.insert(&*namespaced, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_blob(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let namespaced = make_key(collection, key);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        Ok(table.get(&*namespaced)?.map(|v| v.value().to_vec()))
    }

    fn delete_blob(&self, collection: &str, key: &str) -> Result<bool> {
        let namespaced = make_key(collection, key);
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            let existed = table.remove(&*namespaced)?.is_some();
            existed
        };
        txn.commit()?;
        Ok(removed)
    }

    fn scan_blobs(
        &self,
        collection: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let full_prefix = make_key(collection, prefix);
        let skip = collection.len() + 1;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        let mut results = Vec::new();
        for item in table.range(full_prefix.as_str()..)? {
            let (key, value) = item?;
            let key_str = key.value();
            if !key_str.starts_with(&full_prefix) {
                break;
            }
            if let Some(rest) = key_str.get(skip..) {
                results.push((rest.to_string(), value.value().to_vec()));
            }
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    fn read_device(&self, device_id: &str) -> Result<DeviceDocument> {
        let blob = self
            .read_blob(DEVICES, device_id)?
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))?;
        Ok(serde_json::from_slice(&blob)?)
    }

    fn read_rule(&self, rule_id: &str) -> Result<RuleDocument> {
        let blob = self
            .read_blob(RULES, rule_id)?
            .ok_or_else(|| Error::NotFound(format!("Rule not found: {}", rule_id)))?;
        Ok(serde_json::from_slice(&blob)?)
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument> {
        self.read_device(device_id)
    }

    async fn put_device(&self, device_id: &str, document: DeviceDocument) -> Result<()> {
        let blob = serde_json::to_vec(&document)?;
        self.write_blob(DEVICES, device_id, &blob)
    }

    async fn update_device(&self, device_id: &str, patch: serde_json::Value) -> Result<()> {
        let doc = self.read_device(device_id)?;
        let patched = apply_patch(&doc, &patch)?;
        let blob = serde_json::to_vec(&patched)?;
        self.write_blob(DEVICES, device_id, &blob)
    }

    async fn get_generated_data(&self, device_id: &str, limit: usize) -> Result<Vec<GeneratedData>> {
        let prefix = format!("{}:", device_id);
        let blobs = self.scan_blobs(GENERATED, &prefix, limit)?;
        if blobs.is_empty() {
            return Err(Error::NotFound(format!("No generated data for: {}", device_id)));
        }
        blobs
            .into_iter()
            .map(|(_, blob)| serde_json::from_slice(&blob).map_err(Error::from))
            .collect()
    }

    async fn insert_generated_data(&self, device_id: &str, record: GeneratedData) -> Result<()> {
        let key = generated_key(device_id, &record);
        let blob = serde_json::to_vec(&record)?;
        self.write_blob(GENERATED, &key, &blob)
    }

    async fn get_rule(&self, rule_id: &str) -> Result<RuleDocument> {
        self.read_rule(rule_id)
    }

    async fn list_rules(&self) -> Result<Vec<(String, RuleDocument)>> {
        let blobs = self.scan_blobs(RULES, "", usize::MAX)?;
        blobs
            .into_iter()
            .map(|(id, blob)| {
                serde_json::from_slice(&blob)
                    .map(|doc| (id, doc))
                    .map_err(Error::from)
            })
            .collect()
    }

    async fn put_rule(&self, rule_id: &str, document: RuleDocument) -> Result<()> {
        let kind = if self.read_blob(RULES, rule_id)?.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let blob = serde_json::to_vec(&document)?;
        self.write_blob(RULES, rule_id, &blob)?;
        let _ = self.changes.send(RuleChange {
            kind,
            rule_id: rule_id.to_string(),
            document: Some(document),
        });
        Ok(())
    }

    async fn update_rule(&self, rule_id: &str, patch: serde_json::Value) -> Result<()> {
        let doc = self.read_rule(rule_id)?;
        let patched = apply_patch(&doc, &patch)?;
        let blob = serde_json::to_vec(&patched)?;
        self.write_blob(RULES, rule_id, &blob)
    }

    async fn remove_rule(&self, rule_id: &str) -> Result<bool> {
        let removed = self.delete_blob(RULES, rule_id)?;
        if removed {
            let _ = self.changes.send(RuleChange {
                kind: ChangeKind::Removed,
                rule_id: rule_id.to_string(),
                document: None,
            });
        }
        Ok(removed)
    }

    fn watch_rules(&self) -> broadcast::Receiver<RuleChange> {
        self.changes.subscribe()
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(temp_path) {
                tracing::debug!("Failed to remove temporary database {}: {}", temp_path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_device_roundtrip() {
        let store = RedbStore::ephemeral().unwrap();
        store
            .put_device(
                "sw-1",
                DeviceDocument {
                    relay_status: vec![0, 1],
                    voltage: Some(231.2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let doc = store.get_device("sw-1").await.unwrap();
        assert_eq!(doc.relay_status, vec![0, 1]);
        assert_eq!(doc.voltage, Some(231.2));
        assert!(store.get_device("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_generated_data_scan_order() {
        let store = RedbStore::ephemeral().unwrap();
        let now = Utc::now();
        for age_secs in [300, 60, 180] {
            store
                .insert_generated_data("occ-1", GeneratedData::at(now - Duration::seconds(age_secs)))
                .await
                .unwrap();
        }

        let records = store.get_generated_data("occ-1", 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].creation_timestamp, now - Duration::seconds(60));
        assert_eq!(records[1].creation_timestamp, now - Duration::seconds(180));
    }

    #[tokio::test]
    async fn test_generated_data_does_not_leak_across_devices() {
        let store = RedbStore::ephemeral().unwrap();
        let now = Utc::now();
        store
            .insert_generated_data("occ-1", GeneratedData::at(now))
            .await
            .unwrap();
        store
            .insert_generated_data("occ-10", GeneratedData::at(now))
            .await
            .unwrap();

        let records = store.get_generated_data("occ-1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_rule_put_patch_remove() {
        let store = RedbStore::ephemeral().unwrap();
        let mut changes = store.watch_rules();
        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "name": "r", "conditions": []
        }))
        .unwrap();

        store.put_rule("rule-a", doc).await.unwrap();
        store
            .update_rule("rule-a", serde_json::json!({"execution_count": 1}))
            .await
            .unwrap();
        assert_eq!(
            store.get_rule("rule-a").await.unwrap().execution_count,
            Some(1)
        );

        assert!(store.remove_rule("rule-a").await.unwrap());
        assert!(!store.remove_rule("rule-a").await.unwrap());

        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Added);
        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Removed);
    }
}
