//! Relay writeback action.

use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::instructions::{require_i64, require_str};
use crate::vm::EvalContext;

/// `CHANGE_RELAY_STATE {device_id, relay_index, state}`: writes the
/// desired relay state back to the device document. The fleet firmware
/// watches `relay_state`/`insertedBy` and applies the change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRelayStateAction {
    pub device_id: String,
    pub relay_index: usize,
    pub state: i64,
}

impl ChangeRelayStateAction {
    pub fn parse(entry: &Value) -> Result<Self> {
        const TAG: &str = "change_relay_state";
        let relay_index = require_i64(entry, TAG, "relay_index")?;
        if !(0..=64).contains(&relay_index) {
            return Err(RuleError::validation(TAG, "`relay_index` outside 0..=64"));
        }
        let state = require_i64(entry, TAG, "state")?;
        if !(0..=1).contains(&state) {
            return Err(RuleError::validation(TAG, "`state` must be 0 or 1"));
        }
        Ok(Self {
            device_id: require_str(entry, TAG, "device_id")?,
            relay_index: relay_index as usize,
            state,
        })
    }

    pub async fn perform(&self, ctx: &EvalContext) -> Result<()> {
        let document = ctx.store.get_device(&self.device_id).await.map_err(|e| {
            RuleError::Action(format!("Could not find device {}: {}", self.device_id, e))
        })?;

        // Two relay layouts exist in the fleet: SW2 devices mirror a single
        // relay in `relay_state`, everything else carries the full array.
        if !self.device_id.starts_with("SW2-")
            && !document.relay_status.is_empty()
            && self.relay_index >= document.relay_status.len()
        {
            return Err(RuleError::Action(format!(
                "device {} has no relay at index {}",
                self.device_id, self.relay_index
            )));
        }

        let patch = serde_json::json!({
            "relay_state": self.state,
            "insertedBy": "dashboard",
        });
        ctx.store
            .update_device(&self.device_id, patch.clone())
            .await
            .map_err(|e| RuleError::Action(format!("Unable to update the device state: {}", e)))?;

        tracing::info!(
            device_id = %self.device_id,
            state = self.state,
            "Successfully updated device state. Path is devices/{}",
            self.device_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing;
    use rulevm_store::{DeviceDocument, DocumentStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_parse_bounds() {
        let base = json!({
            "type": "change_relay_state",
            "device_id": "sw-1",
            "relay_index": 1,
            "state": 0
        });
        assert!(ChangeRelayStateAction::parse(&base).is_ok());

        let mut bad = base.clone();
        bad["state"] = json!(3);
        assert!(ChangeRelayStateAction::parse(&bad).is_err());
    }

    #[tokio::test]
    async fn test_perform_writes_relay_state_and_marker() {
        let store = Arc::new(MemoryStore::new());
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
        let (ctx, _future_rx) = testing::context(store.clone());

        let action = ChangeRelayStateAction {
            device_id: "sw-1".to_string(),
            relay_index: 1,
            state: 0,
        };
        action.perform(&ctx).await.unwrap();

        let doc = store.get_device("sw-1").await.unwrap();
        assert_eq!(doc.relay_state, Some(0));
        assert_eq!(doc.inserted_by.as_deref(), Some("dashboard"));
        // The status array is the device's report channel; only the desired
        // state is written.
        assert_eq!(doc.relay_status, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_perform_fails_for_unknown_device() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _future_rx) = testing::context(store);
        let action = ChangeRelayStateAction {
            device_id: "ghost".to_string(),
            relay_index: 0,
            state: 1,
        };
        assert!(matches!(action.perform(&ctx).await, Err(RuleError::Action(_))));
    }
}
