//! Line-oriented rule script parsing.
//!
//! Ad-hoc scripts are a flat text rendition of the condition list, one
//! instruction per line:
//!
//! ```text
//! RELAY_STATE sw-1 0 1
//! AND
//! AT_TIME 18:00:00+05:30
//! ```
//!
//! Parsing lowercases each line, maps it to the equivalent condition JSON,
//! and compiles the result as an immediate rule.

use serde_json::{json, Value};

use crate::error::{Result, RuleError};
use crate::rule::Rule;

fn script_err(line: usize, message: impl Into<String>) -> RuleError {
    RuleError::Script {
        line,
        message: message.into(),
    }
}

fn parse_int(token: &str, line: usize, field: &str) -> Result<i64> {
    token
        .parse()
        .map_err(|_| script_err(line, format!("`{}` is not an integer {}", token, field)))
}

fn parse_number(token: &str, line: usize, field: &str) -> Result<f64> {
    token
        .parse()
        .map_err(|_| script_err(line, format!("`{}` is not a numeric {}", token, field)))
}

/// Parse a rule script into raw condition entries.
pub fn parse_rule_script(script: &str) -> Result<Vec<Value>> {
    let mut conditions = Vec::new();

    for (index, raw_line) in script.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim().to_ascii_lowercase();
        if line.is_empty() {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let entry = match (tokens[0], tokens.len()) {
            ("and", 1) => json!({"operation": "logical_and"}),
            ("or", 1) => json!({"operation": "logical_or"}),
            ("at_time", 2) => json!({"operation": "at_time", "time": tokens[1]}),
            ("at_time_with_occurrence", 3) => json!({
                "operation": "at_time_with_occurrence",
                "time": tokens[1],
                "occurrence": parse_int(tokens[2], line_no, "occurrence")?,
            }),
            ("dw_state", 3) => json!({
                "operation": "dw_state",
                "device_id": tokens[1],
                "state": tokens[2],
            }),
            ("dw_state_for", 4) => json!({
                "operation": "dw_state_for",
                "device_id": tokens[1],
                "state": tokens[2],
                "for": parse_int(tokens[3], line_no, "duration")?,
            }),
            ("occupancy_state", 3) => json!({
                "operation": "occupancy",
                "device_id": tokens[1],
                "state": tokens[2],
            }),
            ("occupancy_state_for", 4) => json!({
                "operation": "occupancy_for",
                "device_id": tokens[1],
                "state": tokens[2],
                "for": parse_int(tokens[3], line_no, "duration")?,
            }),
            ("relay_state", 4) => json!({
                "operation": "relay_state",
                "device_id": tokens[1],
                "relay_index": parse_int(tokens[2], line_no, "relay index")?,
                "state": parse_int(tokens[3], line_no, "state")?,
            }),
            ("relay_state_for", 5) => json!({
                "operation": "relay_state_for",
                "device_id": tokens[1],
                "relay_index": parse_int(tokens[2], line_no, "relay index")?,
                "state": parse_int(tokens[3], line_no, "state")?,
                "for": parse_int(tokens[4], line_no, "duration")?,
            }),
            ("temperature", 4) => json!({
                "operation": "temperature",
                "device_id": tokens[1],
                "comparison_op": tokens[2],
                "value": parse_number(tokens[3], line_no, "value")?,
            }),
            ("temperature_for", 5) => json!({
                "operation": "temperature_for",
                "device_id": tokens[1],
                "comparison_op": tokens[2],
                "value": parse_number(tokens[3], line_no, "value")?,
                "for": parse_int(tokens[4], line_no, "duration")?,
            }),
            ("energy_meter", 5) => json!({
                "operation": "energy_meter",
                "device_id": tokens[1],
                "variable": tokens[2],
                "comparison_op": tokens[3],
                "value": parse_number(tokens[4], line_no, "value")?,
            }),
            (operation, _) => {
                return Err(script_err(
                    line_no,
                    format!("Incorrect/Unknown operation: {}", operation),
                ));
            }
        };
        conditions.push(entry);
    }

    Ok(conditions)
}

/// Parse a rule script and compile it as an immediate rule.
pub fn parse_from_string(script: &str) -> Result<Rule> {
    Rule::immediate(parse_rule_script(script)?)
}
