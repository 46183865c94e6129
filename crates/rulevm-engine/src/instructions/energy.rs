//! Energy meter operand.

use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

use super::{require_f64, require_str};

/// Comparison operator for numeric operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Equal,
    Less,
    Greater,
}

impl ComparisonOp {
    pub fn parse(entry: &Value, operation: &str) -> Result<Self> {
        let op = require_str(entry, operation, "comparison_op")?;
        match op.as_str() {
            "=" => Ok(Self::Equal),
            "<" => Ok(Self::Less),
            ">" => Ok(Self::Greater),
            other => Err(RuleError::validation(
                operation,
                format!("`comparison_op` must be one of = < >, got `{}`", other),
            )),
        }
    }

    /// Evaluate `left <op> right`.
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::Equal => left == right,
            Self::Less => left < right,
            Self::Greater => left > right,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::Less => "<",
            Self::Greater => ">",
        }
    }
}

/// Named meter variable on a device document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterVariable {
    Voltage,
    Current,
    RealPower,
    ApparentPower,
    PowerFactor,
    Frequency,
    Energy,
}

impl MeterVariable {
    fn parse(entry: &Value, operation: &str) -> Result<Self> {
        let variable = require_str(entry, operation, "variable")?;
        match variable.to_ascii_lowercase().as_str() {
            "voltage" => Ok(Self::Voltage),
            "current" => Ok(Self::Current),
            "real_power" => Ok(Self::RealPower),
            "apparent_power" => Ok(Self::ApparentPower),
            "power_factor" => Ok(Self::PowerFactor),
            "frequency" => Ok(Self::Frequency),
            "energy" => Ok(Self::Energy),
            other => Err(RuleError::validation(
                operation,
                format!("unknown meter variable `{}`", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::RealPower => "real_power",
            Self::ApparentPower => "apparent_power",
            Self::PowerFactor => "power_factor",
            Self::Frequency => "frequency",
            Self::Energy => "energy",
        }
    }
}

/// `ENERGY_METER {device_id, variable, comparison_op, value}`: compares a
/// meter variable on the device document against the target value.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyMeter {
    pub device_id: String,
    pub variable: MeterVariable,
    pub comparison_op: ComparisonOp,
    pub value: f64,
}

impl EnergyMeter {
    pub fn parse(entry: &Value) -> Result<Self> {
        const OP: &str = "energy_meter";
        Ok(Self {
            device_id: require_str(entry, OP, "device_id")?,
            variable: MeterVariable::parse(entry, OP)?,
            comparison_op: ComparisonOp::parse(entry, OP)?,
            value: require_f64(entry, OP, "value")?,
        })
    }

    pub async fn evaluate(&self, _rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        let document = ctx.store.get_device(&self.device_id).await?;
        let current = document.meter_value(self.variable.as_str()).ok_or_else(|| {
            RuleError::Evaluation(format!(
                "device {} reports no `{}`",
                self.device_id,
                self.variable.as_str()
            ))
        })?;
        tracing::debug!(
            device_id = %self.device_id,
            variable = self.variable.as_str(),
            current,
            op = self.comparison_op.as_str(),
            target = self.value,
            "Evaluating energy meter"
        );
        Ok(self.comparison_op.evaluate(current, self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comparison_ops() {
        assert!(ComparisonOp::Equal.evaluate(5.0, 5.0));
        assert!(ComparisonOp::Less.evaluate(4.9, 5.0));
        assert!(ComparisonOp::Greater.evaluate(5.1, 5.0));
        assert!(!ComparisonOp::Greater.evaluate(5.0, 5.0));
    }

    #[test]
    fn test_parse_variable_and_op() {
        let parsed = EnergyMeter::parse(&json!({
            "operation": "energy_meter",
            "device_id": "em-1",
            "variable": "VOLTAGE",
            "comparison_op": ">",
            "value": 240
        }))
        .unwrap();
        assert_eq!(parsed.variable, MeterVariable::Voltage);
        assert_eq!(parsed.comparison_op, ComparisonOp::Greater);
        assert_eq!(parsed.value, 240.0);

        assert!(EnergyMeter::parse(&json!({
            "operation": "energy_meter",
            "device_id": "em-1",
            "variable": "reactive_power",
            "comparison_op": ">",
            "value": 1
        }))
        .is_err());

        assert!(EnergyMeter::parse(&json!({
            "operation": "energy_meter",
            "device_id": "em-1",
            "variable": "voltage",
            "comparison_op": ">=",
            "value": 1
        }))
        .is_err());
    }
}
