//! Occupancy operands.
//!
//! Occupancy is inferred, not reported: a space counts as occupied while the
//! sensor keeps producing records within its heartbeat interval, and
//! unoccupied once the stream goes quiet.

use chrono::Utc;
use serde_json::Value;

use rulevm_core::config::heartbeat;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::duration::{evaluate_sustained, Continuity};
use super::{require_i64, require_str};

/// Occupancy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyState {
    Occupied,
    Unoccupied,
}

impl OccupancyState {
    fn parse(entry: &Value, operation: &str) -> Result<Self> {
        let state = require_str(entry, operation, "state")?;
        match state.to_ascii_lowercase().as_str() {
            "occupied" => Ok(Self::Occupied),
            "unoccupied" => Ok(Self::Unoccupied),
            other => Err(RuleError::validation(
                operation,
                format!("`state` must be occupied or unoccupied, got `{}`", other),
            )),
        }
    }
}

/// `OCCUPANCY {device_id, state}`: occupied iff the newest record is
/// younger than the sensor's heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Occupancy {
    pub device_id: String,
    pub target_state: OccupancyState,
}

impl Occupancy {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "occupancy";
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            target_state: OccupancyState::parse(entry, OP)?,
        })
    }

    pub async fn evaluate(&self, _rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let records = ctx.store.get_generated_data(&self.device_id, 1).await?;
        let latest = records.into_iter().next().ok_or_else(|| {
            RuleError::Evaluation(format!("no generated data for device {}", self.device_id))
        })?;
        let age_secs = (Utc::now() - latest.creation_timestamp).num_seconds();
        let current = if age_secs < heartbeat::OCCUPANCY_SECS {
            OccupancyState::Occupied
        } else {
            OccupancyState::Unoccupied
        };
        tracing::debug!(
            device_id = %self.device_id,
            age_secs,
            "Last message age decides occupancy"
        );
        Ok(current == self.target_state)
    }
}

/// `OCCUPANCY_FOR {device_id, state, for}`: the occupancy state has been
/// sustained for at least `for` minutes.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyFor {
    pub device_id: String,
    pub target_state: OccupancyState,
    pub for_minutes: i64,
}

impl OccupancyFor {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "occupancy_for";
        let for_minutes = require_i64(entry, OP, "for")?;
        if for_minutes <= 0 {
            return Err(RuleError::validation(OP, "`for` must be positive"));
        }
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            target_state: OccupancyState::parse(entry, OP)?,
            for_minutes,
        })
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        match self.target_state {
            OccupancyState::Occupied => {
                let now = Utc::now();
                evaluate_sustained(
                    rule,
                    ctx,
                    &self.device_id,
                    heartbeat::OCCUPANCY_FOR_SECS,
                    self.for_minutes,
                    Continuity::MaxGap,
                    // Applied to the newest record only: the walk itself is
                    // gap-driven.
                    &move |record| {
                        (now - record.creation_timestamp).num_seconds() < heartbeat::OCCUPANCY_SECS
                    },
                )
                .await
            }
            OccupancyState::Unoccupied => self.evaluate_unoccupied(rule, ctx).await,
        }
    }

    /// Unoccupied duration is the silence since the last record, counted
    /// from the record itself; there is no history to walk.
    async fn evaluate_unoccupied(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let records = ctx.store.get_generated_data(&self.device_id, 1).await?;
        let latest = records.into_iter().next().ok_or_else(|| {
            RuleError::Evaluation(format!("no generated data for device {}", self.device_id))
        })?;
        let age_secs = (Utc::now() - latest.creation_timestamp).num_seconds();
        if age_secs < heartbeat::OCCUPANCY_SECS {
            // Still occupied.
            return Ok(false);
        }
        let measured_minutes = age_secs as f64 / 60.0;
        if measured_minutes >= self.for_minutes as f64 {
            return Ok(true);
        }
        if rule.periodic_execution {
            let delay = ((self.for_minutes as f64 - measured_minutes) * 60.0).ceil() as u64;
            ctx.scheduler.park_for_retry(rule, delay).await;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Rule;
    use crate::vm::testing;
    use chrono::Duration;
    use rulevm_store::{DocumentStore, GeneratedData, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn occupancy_for_rule(rule_id: &str, device_id: &str, for_minutes: i64) -> Rule {
        let document: rulevm_store::RuleDocument = serde_json::from_value(json!({
            "name": "sustained occupancy",
            "conditions": [{
                "operation": "occupancy_for",
                "device_id": device_id,
                "state": "occupied",
                "for": for_minutes
            }]
        }))
        .unwrap();
        Rule::compile(rule_id, &document).unwrap()
    }

    async fn store_with_record_ages(device_id: &str, ages_secs: &[i64]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let now = chrono::Utc::now();
        for age in ages_secs {
            store
                .insert_generated_data(device_id, GeneratedData::at(now - Duration::seconds(*age)))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_duration_short_parks_the_shortfall() {
        // Records 30 s and 90 s old: sustained 1.5 min against a 5 min
        // target, so the rule parks for the remaining 3.5 min.
        let store = store_with_record_ages("occ-1", &[30, 90]).await;
        let rule = occupancy_for_rule("rule-occ", "occ-1", 5);
        let (ctx, future_rx) = testing::context(store);

        let result = crate::eval::evaluate(&rule, &ctx).await.unwrap();
        assert!(!result);

        let (clone, delay) = future_rx.try_recv().unwrap();
        assert_eq!(clone.rule_id, "rule-occ");
        assert!((200..=215).contains(&delay), "delay was {}", delay);
    }

    #[tokio::test]
    async fn test_duration_met_is_true_without_parking() {
        let store = store_with_record_ages("occ-1", &[30, 90]).await;
        let rule = occupancy_for_rule("rule-occ", "occ-1", 1);
        let (ctx, future_rx) = testing::context(store);

        assert!(crate::eval::evaluate(&rule, &ctx).await.unwrap());
        assert!(future_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gap_beyond_heartbeat_breaks_the_run() {
        // 30 s and 300 s old records: the 270 s gap exceeds the 120 s
        // heartbeat, so only the newest record counts.
        let store = store_with_record_ages("occ-1", &[30, 300]).await;
        let rule = occupancy_for_rule("rule-occ", "occ-1", 5);
        let (ctx, future_rx) = testing::context(store);

        assert!(!crate::eval::evaluate(&rule, &ctx).await.unwrap());
        let (_, delay) = future_rx.try_recv().unwrap();
        // Shortfall measured from the 30 s record alone.
        assert!((265..=280).contains(&delay), "delay was {}", delay);
    }

    #[tokio::test]
    async fn test_silent_sensor_is_unoccupied() {
        let store = store_with_record_ages("occ-1", &[400]).await;
        let rule = Rule::immediate(vec![json!({
            "operation": "occupancy",
            "device_id": "occ-1",
            "state": "unoccupied"
        })])
        .unwrap();
        let (ctx, _future_rx) = testing::context(store);
        assert!(crate::eval::evaluate(&rule, &ctx).await.unwrap());
    }

    #[test]
    fn test_parse_state_enum() {
        let parsed = OccupancyFor::parse(&json!({
            "operation": "occupancy_for",
            "device_id": "occ-1",
            "state": "Occupied",
            "for": 5
        }))
        .unwrap();
        assert_eq!(parsed.target_state, OccupancyState::Occupied);

        let err = Occupancy::parse(&json!({
            "operation": "occupancy", "device_id": "occ-1", "state": "busy"
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::Validation { .. }));
    }
}
