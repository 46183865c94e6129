//! Relay (switch) operands.

use serde_json::Value;

use rulevm_core::config::heartbeat;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::duration::{evaluate_sustained, Continuity};
use super::{require_i64, require_str};

const MAX_RELAY_INDEX: i64 = 64;

fn parse_relay_index(entry: &Value, operation: &str) -> Result<usize> {
    let relay_index = require_i64(entry, operation, "relay_index")?;
    if !(0..=MAX_RELAY_INDEX).contains(&relay_index) {
        return Err(RuleError::validation(
            operation,
            format!("`relay_index` {} outside 0..={}", relay_index, MAX_RELAY_INDEX),
        ));
    }
    Ok(relay_index as usize)
}

fn parse_relay_target(entry: &Value, operation: &str) -> Result<i64> {
    let state = require_i64(entry, operation, "state")?;
    if !(0..=1).contains(&state) {
        return Err(RuleError::validation(operation, "`state` must be 0 or 1"));
    }
    Ok(state)
}

/// `RELAY_STATE {device_id, relay_index, state}`: true iff the device
/// document's `relayStatus[relay_index]` equals the target.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayState {
    pub device_id: String,
    pub relay_index: usize,
    pub target_state: i64,
}

impl RelayState {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "relay_state";
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            relay_index: parse_relay_index(entry, OP)?,
            target_state: parse_relay_target(entry, OP)?,
        })
    }

    pub async fn evaluate(&self, _rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let document = ctx.store.get_device(&self.device_id).await?;
        let current = document.relay_status.get(self.relay_index).copied().ok_or_else(|| {
            RuleError::Evaluation(format!(
                "device {} has no relay at index {}",
                self.device_id, self.relay_index
            ))
        })?;
        tracing::debug!(
            device_id = %self.device_id,
            current,
            target = self.target_state,
            "Evaluating relay state"
        );
        Ok(current == self.target_state)
    }
}

/// `RELAY_STATE_FOR {device_id, relay_index, state, for}`: the relay has
/// held the target state continuously for at least `for` minutes.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayStateFor {
    pub device_id: String,
    pub relay_index: usize,
    pub target_state: i64,
    pub for_minutes: i64,
}

impl RelayStateFor {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "relay_state_for";
        let for_minutes = require_i64(entry, OP, "for")?;
        if for_minutes <= 0 {
            return Err(RuleError::validation(OP, "`for` must be positive"));
        }
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            relay_index: parse_relay_index(entry, OP)?,
            target_state: parse_relay_target(entry, OP)?,
            for_minutes,
        })
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let relay_index = self.relay_index;
        let target = self.target_state;
        evaluate_sustained(
            rule,
            ctx,
            &self.device_id,
            heartbeat::SWITCH_STATE_SECS,
            self.for_minutes,
            Continuity::RecordMatches,
            &move |record| record.relay(relay_index) == Some(target),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Rule;
    use crate::vm::testing;
    use chrono::{Duration, Utc};
    use rulevm_store::{DeviceDocument, DocumentStore, GeneratedData, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_relay_state_match() {
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
        let (ctx, _future_rx) = testing::context(store);

        let on = Rule::immediate(vec![json!({
            "operation": "relay_state", "device_id": "sw-1", "relay_index": 0, "state": 1
        })])
        .unwrap();
        assert!(crate::eval::evaluate(&on, &ctx).await.unwrap());

        let off = Rule::immediate(vec![json!({
            "operation": "relay_state", "device_id": "sw-1", "relay_index": 1, "state": 1
        })])
        .unwrap();
        assert!(!crate::eval::evaluate(&off, &ctx).await.unwrap());
    }

    fn relay_for_rule(device_id: &str, for_minutes: i64) -> Rule {
        let document: rulevm_store::RuleDocument = serde_json::from_value(json!({
            "name": "relay held",
            "conditions": [{
                "operation": "relay_state_for",
                "device_id": device_id,
                "relay_index": 0,
                "state": 1,
                "for": for_minutes
            }]
        }))
        .unwrap();
        Rule::compile("rule-sw", &document).unwrap()
    }

    #[tokio::test]
    async fn test_sustained_relay_walks_matching_records() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (age_secs, state) in [(120, 1), (600, 1)] {
            store
                .insert_generated_data(
                    "sw-1",
                    GeneratedData::at(now - Duration::seconds(age_secs)).with_relay(0, state),
                )
                .await
                .unwrap();
        }
        let (ctx, future_rx) = testing::context(store);

        // Both records hold state 1: the run reaches back ten minutes.
        let rule = relay_for_rule("sw-1", 5);
        assert!(crate::eval::evaluate(&rule, &ctx).await.unwrap());
        assert!(future_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sustained_relay_stops_at_state_change() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (age_secs, state) in [(120, 1), (600, 0)] {
            store
                .insert_generated_data(
                    "sw-1",
                    GeneratedData::at(now - Duration::seconds(age_secs)).with_relay(0, state),
                )
                .await
                .unwrap();
        }
        let (ctx, future_rx) = testing::context(store);

        // The older record flipped the relay: only two minutes count, and
        // the rule parks for the remaining three.
        let rule = relay_for_rule("sw-1", 5);
        assert!(!crate::eval::evaluate(&rule, &ctx).await.unwrap());
        let (_, delay) = future_rx.try_recv().unwrap();
        assert!((170..=185).contains(&delay), "delay was {}", delay);
    }

    #[tokio::test]
    async fn test_mismatched_state_returns_false_without_parking() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_generated_data(
                "sw-1",
                GeneratedData::at(Utc::now() - Duration::seconds(30)).with_relay(0, 0),
            )
            .await
            .unwrap();
        let (ctx, future_rx) = testing::context(store);

        let rule = relay_for_rule("sw-1", 5);
        assert!(!crate::eval::evaluate(&rule, &ctx).await.unwrap());
        // State does not match at all: the next device event re-triggers,
        // no timer is needed.
        assert!(future_rx.try_recv().is_err());
    }

    #[test]
    fn test_parse_bounds() {
        let base = json!({
            "operation": "relay_state",
            "device_id": "sw-1",
            "relay_index": 0,
            "state": 1
        });
        assert!(RelayState::parse(&base).is_ok());

        let mut bad_index = base.clone();
        bad_index["relay_index"] = json!(65);
        assert!(RelayState::parse(&bad_index).is_err());

        let mut bad_state = base.clone();
        bad_state["state"] = json!(2);
        assert!(RelayState::parse(&bad_state).is_err());

        let mut missing = base;
        missing.as_object_mut().unwrap().remove("device_id");
        assert!(RelayState::parse(&missing).is_err());
    }

    #[test]
    fn test_parse_for_requires_positive_duration() {
        let entry = json!({
            "operation": "relay_state_for",
            "device_id": "sw-1",
            "relay_index": 1,
            "state": 0,
            "for": 0
        });
        assert!(RelayStateFor::parse(&entry).is_err());
    }
}
