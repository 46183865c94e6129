//! Document store for the RuleVM.
//!
//! Models the three surfaces the engine reads and writes: device documents,
//! their `generatedData` history, and the `rules` collection with its change
//! stream. Two backends are provided: an in-memory store for tests and
//! embedded deployments, and a persistent `redb` store.

pub mod documents;
pub mod error;
pub mod memory;
pub mod redb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use documents::{apply_patch, DeviceDocument, GeneratedData, RuleDocument};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use self::redb::RedbStore;

/// Kind of a rule-collection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One rule-collection change, as delivered to `watch_rules` subscribers.
#[derive(Debug, Clone)]
pub struct RuleChange {
    pub kind: ChangeKind,
    pub rule_id: String,
    /// The document after the change; `None` for removals.
    pub document: Option<RuleDocument>,
}

/// The document store the engine evaluates against.
///
/// Reads return the freshest stored state; generated-data history is always
/// newest-first. Rule writes through `put_rule`/`remove_rule` feed the
/// change stream; metadata patches through `update_rule` do not, so the
/// engine's own execution-count writes cannot re-trigger evaluation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch `devices/{device_id}`.
    async fn get_device(&self, device_id: &str) -> Result<DeviceDocument>;

    /// Create or replace `devices/{device_id}`.
    async fn put_device(&self, device_id: &str, document: DeviceDocument) -> Result<()>;

    /// Shallow-merge `patch` into `devices/{device_id}`.
    async fn update_device(&self, device_id: &str, patch: serde_json::Value) -> Result<()>;

    /// Up to `limit` generated-data records for a device, newest first.
    async fn get_generated_data(&self, device_id: &str, limit: usize) -> Result<Vec<GeneratedData>>;

    /// Append a generated-data record for a device.
    async fn insert_generated_data(&self, device_id: &str, record: GeneratedData) -> Result<()>;

    /// Fetch `rules/{rule_id}`.
    async fn get_rule(&self, rule_id: &str) -> Result<RuleDocument>;

    /// All rule documents with their ids.
    async fn list_rules(&self) -> Result<Vec<(String, RuleDocument)>>;

    /// Create or replace `rules/{rule_id}`; emits `Added` or `Modified`.
    async fn put_rule(&self, rule_id: &str, document: RuleDocument) -> Result<()>;

    /// Shallow-merge `patch` into `rules/{rule_id}` without emitting a
    /// change event.
    async fn update_rule(&self, rule_id: &str, patch: serde_json::Value) -> Result<()>;

    /// Delete `rules/{rule_id}`; emits `Removed` when it existed.
    async fn remove_rule(&self, rule_id: &str) -> Result<bool>;

    /// Subscribe to rule-collection changes.
    fn watch_rules(&self) -> broadcast::Receiver<RuleChange>;
}
