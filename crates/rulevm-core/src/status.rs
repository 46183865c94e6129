//! Status sink for the VM's observability loop.
//!
//! The VM publishes a handful of summary counters once per second. The sink
//! is a trait so deployments can forward the counters to whatever key/value
//! surface they already run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Receives the VM's summary counters.
pub trait StatusSink: Send + Sync {
    /// Publish one key/value pair. Implementations must not block.
    fn publish(&self, key: &str, value: String);
}

/// Sink that keeps the latest value per key in memory.
#[derive(Clone, Default)]
pub struct InMemoryStatusSink {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value published for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Snapshot of all published keys.
    pub fn all(&self) -> HashMap<String, String> {
        self.values.read().clone()
    }
}

impl StatusSink for InMemoryStatusSink {
    fn publish(&self, key: &str, value: String) {
        self.values.write().insert(key.to_string(), value);
    }
}

/// Sink that emits each counter as a tracing event.
#[derive(Clone, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn publish(&self, key: &str, value: String) {
        tracing::debug!(key, %value, "status");
    }
}
