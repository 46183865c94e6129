//! Door/window contact-sensor operands.

use serde_json::Value;

use rulevm_core::config::heartbeat;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::duration::{evaluate_sustained, Continuity};
use super::{require_i64, require_str};

/// Door/window position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwPosition {
    Open,
    Close,
}

impl DwPosition {
    fn parse(entry: &Value, operation: &str) -> Result<Self> {
        let state = require_str(entry, operation, "state")?;
        match state.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            other => Err(RuleError::validation(
                operation,
                format!("`state` must be open or close, got `{}`", other),
            )),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// `DW_STATE {device_id, state}`: the most recent record's `status`
/// equals the target position.
#[derive(Debug, Clone, PartialEq)]
pub struct DwState {
    pub device_id: String,
    pub target_state: DwPosition,
}

impl DwState {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "dw_state";
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            target_state: DwPosition::parse(entry, OP)?,
        })
    }

    pub async fn evaluate(&self, _rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let records = ctx.store.get_generated_data(&self.device_id, 1).await?;
        let latest = records.into_iter().next().ok_or_else(|| {
            RuleError::Evaluation(format!("no generated data for device {}", self.device_id))
        })?;
        let current = latest.status.as_deref().unwrap_or_default().to_ascii_lowercase();
        tracing::debug!(
            device_id = %self.device_id,
            %current,
            target = self.target_state.as_str(),
            "Comparing door window state"
        );
        Ok(current == self.target_state.as_str())
    }
}

/// `DW_STATE_FOR {device_id, state, for}`: the position has been held for
/// at least `for` minutes.
#[derive(Debug, Clone, PartialEq)]
pub struct DwStateFor {
    pub device_id: String,
    pub target_state: DwPosition,
    pub for_minutes: i64,
}

impl DwStateFor {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "dw_state_for";
        let for_minutes = require_i64(entry, OP, "for")?;
        if for_minutes <= 0 {
            return Err(RuleError::validation(OP, "`for` must be positive"));
        }
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            target_state: DwPosition::parse(entry, OP)?,
            for_minutes,
        })
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let target = self.target_state.as_str();
        evaluate_sustained(
            rule,
            ctx,
            &self.device_id,
            heartbeat::SWITCH_STATE_SECS,
            self.for_minutes,
            Continuity::RecordMatches,
            &move |record| {
                record
                    .status
                    .as_deref()
                    .map(|s| s.eq_ignore_ascii_case(target))
                    .unwrap_or(false)
            },
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
    use rulevm_store::{DocumentStore, GeneratedData, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_latest_status_decides_state() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_generated_data(
                "dw-1",
                GeneratedData::at(now - Duration::seconds(10)).with_status("Open"),
            )
            .await
            .unwrap();
        store
            .insert_generated_data(
                "dw-1",
                GeneratedData::at(now - Duration::seconds(700)).with_status("close"),
            )
            .await
            .unwrap();
        let (ctx, _future_rx) = testing::context(store);

        let open = Rule::immediate(vec![json!({
            "operation": "dw_state", "device_id": "dw-1", "state": "open"
        })])
        .unwrap();
        assert!(crate::eval::evaluate(&open, &ctx).await.unwrap());

        let closed = Rule::immediate(vec![json!({
            "operation": "dw_state", "device_id": "dw-1", "state": "close"
        })])
        .unwrap();
        assert!(!crate::eval::evaluate(&closed, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_sustained_open_walks_status_history() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for age_secs in [60, 360, 660] {
            store
                .insert_generated_data(
                    "dw-1",
                    GeneratedData::at(now - Duration::seconds(age_secs)).with_status("open"),
                )
                .await
                .unwrap();
        }
        let (ctx, future_rx) = testing::context(store);

        let document: rulevm_store::RuleDocument = serde_json::from_value(json!({
            "name": "door left open",
            "conditions": [{
                "operation": "dw_state_for",
                "device_id": "dw-1",
                "state": "open",
                "for": 10
            }]
        }))
        .unwrap();
        let rule = Rule::compile("rule-dw", &document).unwrap();

        assert!(crate::eval::evaluate(&rule, &ctx).await.unwrap());
        assert!(future_rx.try_recv().is_err());
    }

    #[test]
    fn test_parse_state_enum() {
        let open = DwState::parse(&json!({
            "operation": "dw_state", "device_id": "dw-1", "state": "OPEN"
        }))
        .unwrap();
        assert_eq!(open.target_state, DwPosition::Open);

        let err = DwState::parse(&json!({
            "operation": "dw_state", "device_id": "dw-1", "state": "ajar"
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::Validation { .. }));
    }
}
