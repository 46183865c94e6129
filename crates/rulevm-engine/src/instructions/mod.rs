//! The closed instruction set.
//!
//! One variant per operand/operator kind. Operand data is validated when the
//! instruction is constructed from a raw condition entry; a validation
//! failure aborts compilation of the owning rule and leaves every other rule
//! untouched. Operation strings are matched case-insensitively.

pub mod door_window;
pub mod duration;
pub mod energy;
pub mod occupancy;
pub mod relay;
pub mod temperature;
pub mod time;

use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::rule::Rule;
use crate::vm::EvalContext;

pub use door_window::{DwState, DwStateFor};
pub use energy::{ComparisonOp, EnergyMeter, MeterVariable};
pub use occupancy::{Occupancy, OccupancyFor};
pub use relay::{RelayState, RelayStateFor};
pub use temperature::{Temperature, TemperatureFor};
pub use time::{AtTime, AtTimeWithOccurrence};

/// One compiled condition atom.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LogicalAnd,
    LogicalOr,
    AtTime(AtTime),
    AtTimeWithOccurrence(AtTimeWithOccurrence),
    RelayState(RelayState),
    RelayStateFor(RelayStateFor),
    DwState(DwState),
    DwStateFor(DwStateFor),
    Occupancy(Occupancy),
    OccupancyFor(OccupancyFor),
    EnergyMeter(EnergyMeter),
    Temperature(Temperature),
    TemperatureFor(TemperatureFor),
}

impl Instruction {
    /// Construct and validate an instruction from a raw condition entry.
    pub fn parse(entry: &Value) -> Result<Self> {
        let operation = entry
            .get("operation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuleError::validation("condition", "missing `operation` field"))?
            .to_ascii_lowercase();

        match operation.as_str() {
            "logical_and" => Ok(Self::LogicalAnd),
            "logical_or" => Ok(Self::LogicalOr),
            "at_time" => Ok(Self::AtTime(AtTime::parse(entry)?)),
            "at_time_with_occurrence" => {
                Ok(Self::AtTimeWithOccurrence(AtTimeWithOccurrence::parse(entry)?))
            }
            "relay_state" => Ok(Self::RelayState(RelayState::parse(entry)?)),
            "relay_state_for" => Ok(Self::RelayStateFor(RelayStateFor::parse(entry)?)),
            "dw_state" => Ok(Self::DwState(DwState::parse(entry)?)),
            "dw_state_for" => Ok(Self::DwStateFor(DwStateFor::parse(entry)?)),
            "occupancy" => Ok(Self::Occupancy(Occupancy::parse(entry)?)),
            "occupancy_for" => Ok(Self::OccupancyFor(OccupancyFor::parse(entry)?)),
            "energy_meter" => Ok(Self::EnergyMeter(EnergyMeter::parse(entry)?)),
            "temperature" => Ok(Self::Temperature(Temperature::parse(entry)?)),
            "temperature_for" => Ok(Self::TemperatureFor(TemperatureFor::parse(entry)?)),
            other => Err(RuleError::UnknownOperation(other.to_string())),
        }
    }

    /// Whether this instruction is a binary logical operator.
    pub fn is_operator(&self) -> bool {
        matches!(self, Self::LogicalAnd | Self::LogicalOr)
    }

    /// Canonical opcode string.
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::LogicalAnd => "LOGICAL_AND",
            Self::LogicalOr => "LOGICAL_OR",
            Self::AtTime(_) => "AT_TIME",
            Self::AtTimeWithOccurrence(_) => "AT_TIME_WITH_OCCURRENCE",
            Self::RelayState(_) => "RELAY_STATE",
            Self::RelayStateFor(_) => "RELAY_STATE_FOR",
            Self::DwState(_) => "DW_STATE",
            Self::DwStateFor(_) => "DW_STATE_FOR",
            Self::Occupancy(_) => "OCCUPANCY",
            Self::OccupancyFor(_) => "OCCUPANCY_FOR",
            Self::EnergyMeter(_) => "ENERGY_METER",
            Self::Temperature(_) => "TEMPERATURE",
            Self::TemperatureFor(_) => "TEMPERATURE_FOR",
        }
    }

    /// Device this operand reads, if any. Time operands depend on no device.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::RelayState(op) => Some(&op.device_id),
            Self::RelayStateFor(op) => Some(&op.device_id),
            Self::DwState(op) => Some(&op.device_id),
            Self::DwStateFor(op) => Some(&op.device_id),
            Self::Occupancy(op) => Some(&op.device_id),
            Self::OccupancyFor(op) => Some(&op.device_id),
            Self::EnergyMeter(op) => Some(&op.device_id),
            Self::Temperature(op) => Some(&op.device_id),
            Self::TemperatureFor(op) => Some(&op.device_id),
            _ => None,
        }
    }

    /// Evaluate this operand against live state.
    ///
    /// `rule` is the owning rule, passed by reference to reach
    /// `periodic_execution` and the occurrence writeback without an owning
    /// back-pointer.
    pub async fn evaluate(&self, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
        match self {
            Self::LogicalAnd | Self::LogicalOr => Err(RuleError::Evaluation(
                "logical operators are folded by the evaluator, not evaluated".to_string(),
            )),
            Self::AtTime(op) => op.evaluate(rule, ctx).await,
            Self::AtTimeWithOccurrence(op) => op.evaluate(rule, ctx).await,
            Self::RelayState(op) => op.evaluate(rule, ctx).await,
            Self::RelayStateFor(op) => op.evaluate(rule, ctx).await,
            Self::DwState(op) => op.evaluate(rule, ctx).await,
            Self::DwStateFor(op) => op.evaluate(rule, ctx).await,
            Self::Occupancy(op) => op.evaluate(rule, ctx).await,
            Self::OccupancyFor(op) => op.evaluate(rule, ctx).await,
            Self::EnergyMeter(op) => op.evaluate(rule, ctx).await,
            Self::Temperature(op) => op.evaluate(rule, ctx).await,
            Self::TemperatureFor(op) => op.evaluate(rule, ctx).await,
        }
    }
}

/// Required string field of a condition entry.
pub(crate) fn require_str(entry: &Value, operation: &str, field: &str) -> Result<String> {
    entry
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| RuleError::validation(operation, format!("missing or non-string `{}`", field)))
}

/// Required integer field of a condition entry.
pub(crate) fn require_i64(entry: &Value, operation: &str, field: &str) -> Result<i64> {
    entry
        .get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RuleError::validation(operation, format!("missing or non-integer `{}`", field)))
}

/// Required numeric field of a condition entry.
pub(crate) fn require_f64(entry: &Value, operation: &str, field: &str) -> Result<f64> {
    entry
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| RuleError::validation(operation, format!("missing or non-numeric `{}`", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_matching_is_case_insensitive() {
        let ins = Instruction::parse(&json!({
            "operation": "RELAY_STATE",
            "device_id": "sw-1",
            "relay_index": 0,
            "state": 1
        }))
        .unwrap();
        assert_eq!(ins.opcode(), "RELAY_STATE");
        assert_eq!(ins.device_id(), Some("sw-1"));
    }

    #[test]
    fn test_unknown_operation_is_typed() {
        let err = Instruction::parse(&json!({"operation": "blink_lights"})).unwrap_err();
        assert!(matches!(err, RuleError::UnknownOperation(op) if op == "blink_lights"));
    }

    #[test]
    fn test_missing_operation_field() {
        let err = Instruction::parse(&json!({"time": "06:00:00+00:00"})).unwrap_err();
        assert!(matches!(err, RuleError::Validation { .. }));
    }

    #[test]
    fn test_operators_have_no_device() {
        let and = Instruction::parse(&json!({"operation": "logical_and"})).unwrap();
        assert!(and.is_operator());
        assert_eq!(and.device_id(), None);
    }
}
