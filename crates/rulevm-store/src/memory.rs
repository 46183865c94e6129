//! In-memory document store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::documents::{apply_patch, DeviceDocument, GeneratedData, RuleDocument};
use crate::{ChangeKind, DocumentStore, Error, Result, RuleChange};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Document store backed by process memory. Used by tests and by
/// deployments that resync state from the fleet at startup.
#[derive(Clone)]
pub struct MemoryStore {
    devices: Arc<RwLock<HashMap<String, DeviceDocument>>>,
    /// Per-device generated data, newest first.
    generated: Arc<RwLock<HashMap<String, Vec<GeneratedData>>>>,
    rules: Arc<RwLock<HashMap<String, RuleDocument>>>,
    changes: broadcast::Sender<RuleChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            generated: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(RwLock::new(HashMap::new())),
            changes: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument> {
        self.devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))
    }

    async fn put_device(&self, device_id: &str, document: DeviceDocument) -> Result<()> {
        self.devices.write().insert(device_id.to_string(), document);
        Ok(())
    }

    async fn update_device(&self, device_id: &str, patch: serde_json::Value) -> Result<()> {
        let mut devices = self.devices.write();
        let doc = devices
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))?;
        let patched = apply_patch(doc, &patch)?;
        devices.insert(device_id.to_string(), patched);
        Ok(())
    }

    async fn get_generated_data(&self, device_id: &str, limit: usize) -> Result<Vec<GeneratedData>> {
        let generated = self.generated.read();
        let records = generated
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No generated data for: {}", device_id)))?;
        Ok(records.iter().take(limit).cloned().collect())
    }

    async fn insert_generated_data(&self, device_id: &str, record: GeneratedData) -> Result<()> {
        let mut generated = self.generated.write();
        let records = generated.entry(device_id.to_string()).or_default();
        records.push(record);
        records.sort_by(|a, b| b.creation_timestamp.cmp(&a.creation_timestamp));
        Ok(())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<RuleDocument> {
        self.rules
            .read()
            .get(rule_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Rule not found: {}", rule_id)))
    }

    async fn list_rules(&self) -> Result<Vec<(String, RuleDocument)>> {
        let mut rules: Vec<_> = self
            .rules
            .read()
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();
        rules.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rules)
    }

    async fn put_rule(&self, rule_id: &str, document: RuleDocument) -> Result<()> {
        let kind = {
            let mut rules = self.rules.write();
            let kind = if rules.contains_key(rule_id) {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            };
            rules.insert(rule_id.to_string(), document.clone());
            kind
        };
        let _ = self.changes.send(RuleChange {
            kind,
            rule_id: rule_id.to_string(),
            document: Some(document),
        });
        Ok(())
    }

    async fn update_rule(&self, rule_id: &str, patch: serde_json::Value) -> Result<()> {
        let mut rules = self.rules.write();
        let doc = rules
            .get(rule_id)
            .ok_or_else(|| Error::NotFound(format!("Rule not found: {}", rule_id)))?;
        let patched = apply_patch(doc, &patch)?;
        rules.insert(rule_id.to_string(), patched);
        Ok(())
    }

    async fn remove_rule(&self, rule_id: &str) -> Result<bool> {
        let removed = self.rules.write().remove(rule_id).is_some();
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_device_roundtrip_and_patch() {
        let store = MemoryStore::new();
        store
            .put_device(
                "sw-1",
                DeviceDocument {
                    relay_status: vec![1, 0],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .update_device("sw-1", serde_json::json!({"relay_state": 0, "insertedBy": "dashboard"}))
            .await
            .unwrap();

        let doc = store.get_device("sw-1").await.unwrap();
        assert_eq!(doc.relay_status, vec![1, 0]);
        assert_eq!(doc.relay_state, Some(0));
        assert_eq!(doc.inserted_by.as_deref(), Some("dashboard"));
    }

    #[tokio::test]
    async fn test_generated_data_newest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_generated_data("occ-1", GeneratedData::at(now - Duration::seconds(90)))
            .await
            .unwrap();
        store
            .insert_generated_data("occ-1", GeneratedData::at(now - Duration::seconds(30)))
            .await
            .unwrap();

        let records = store.get_generated_data("occ-1", 5).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].creation_timestamp > records[1].creation_timestamp);

        let limited = store.get_generated_data("occ-1", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].creation_timestamp, now - Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_rule_changes_are_broadcast() {
        let store = MemoryStore::new();
        let mut changes = store.watch_rules();

        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "name": "r", "conditions": []
        }))
        .unwrap();

        store.put_rule("rule-a", doc.clone()).await.unwrap();
        store.put_rule("rule-a", doc).await.unwrap();
        store.remove_rule("rule-a").await.unwrap();

        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Added);
        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Modified);
        let removed = changes.recv().await.unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert!(removed.document.is_none());
    }

    #[tokio::test]
    async fn test_metadata_patch_is_silent() {
        let store = MemoryStore::new();
        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "name": "r", "conditions": []
        }))
        .unwrap();
        store.put_rule("rule-a", doc).await.unwrap();

        let mut changes = store.watch_rules();
        store
            .update_rule("rule-a", serde_json::json!({"execution_count": 3}))
            .await
            .unwrap();

        assert!(changes.try_recv().is_err());
        assert_eq!(
            store.get_rule("rule-a").await.unwrap().execution_count,
            Some(3)
        );
    }
}
