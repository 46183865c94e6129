//! Temperature operands. Same shape as the relay variants, read from the
//! device document's temperature field and the generated-data history.

use serde_json::Value;

use rulevm_core::config::heartbeat;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::duration::{evaluate_sustained, Continuity};
use super::energy::ComparisonOp;
use super::{require_f64, require_i64, require_str};

/// `TEMPERATURE {device_id, comparison_op, value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Temperature {
    pub device_id: String,
    pub comparison_op: ComparisonOp,
    pub value: f64,
}

impl Temperature {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "temperature";
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            comparison_op: ComparisonOp::parse(entry, OP)?,
            value: require_f64(entry, OP, "value")?,
        })
    }

    pub async fn evaluate(&self, _rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let document = ctx.store.get_device(&self.device_id).await?;
        let current = document.temperature.ok_or_else(|| {
            RuleError::Evaluation(format!("device {} reports no temperature", self.device_id))
        })?;
        Ok(self.comparison_op.evaluate(current, self.value))
    }
}

/// `TEMPERATURE_FOR {device_id, comparison_op, value, for}`: the
/// comparison has held for at least `for` minutes of history.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureFor {
    pub device_id: String,
    pub comparison_op: ComparisonOp,
    pub value: f64,
    pub for_minutes: i64,
}

impl TemperatureFor {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "temperature_for";
        let for_minutes = require_i64(entry, OP, "for")?;
        if for_minutes <= 0 {
            return Err(RuleError::validation(OP, "`for` must be positive"));
        }
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            comparison_op: ComparisonOp::parse(entry, OP)?,
            value: require_f64(entry, OP, "value")?,
            for_minutes,
        })
    }

    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let op = self.comparison_op;
        let value = self.value;
        evaluate_sustained(
            rule,
            ctx,
            &self.device_id,
            heartbeat::SWITCH_STATE_SECS,
            self.for_minutes,
            Continuity::RecordMatches,
            &move |record| record.temperature.map(|t| op.evaluate(t, value)).unwrap_or(false),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse() {
        let parsed = TemperatureFor::parse(&json!({
            "operation": "temperature_for",
            "device_id": "th-1",
            "comparison_op": ">",
            "value": 30.5,
            "for": 10
        }))
        .unwrap();
        assert_eq!(parsed.for_minutes, 10);
        assert!(Temperature::parse(&json!({
            "operation": "temperature",
            "device_id": "th-1",
            "comparison_op": "!",
            "value": 1
        }))
        .is_err());
    }
}
