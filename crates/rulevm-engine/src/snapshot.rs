//! Persistence of the awaiting-completion list.
//!
//! The snapshot is a bincode blob rewritten in full on every dirty tick.
//! Restore is best-effort: a blob that fails to decode restores nothing,
//! and an entry that no longer compiles is skipped, so schema drift between
//! versions can never take the engine down.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use rulevm_store::RuleDocument;

use crate::error::{Result, RuleError};
use crate::rule::Rule;

/// Persistable form of a parked rule instance.
///
/// Conditions and actions are carried as JSON text: the snapshot format is
/// not self-describing, so dynamic JSON values cannot be embedded directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    rule_id: String,
    name: String,
    description: String,
    enabled: bool,
    conditions_json: String,
    actions_json: String,
    last_execution_millis: Option<i64>,
    execution_count: u64,
    periodic_execution: bool,
}

impl RuleSnapshot {
    pub fn capture(rule: &Rule) -> Result<Self> {
        Ok(Self {
            rule_id: rule.rule_id.clone(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            enabled: rule.enabled,
            conditions_json: serde_json::to_string(&rule.conditions)
                .map_err(|e| RuleError::Snapshot(e.to_string()))?,
            actions_json: serde_json::to_string(&rule.actions)
                .map_err(|e| RuleError::Snapshot(e.to_string()))?,
            last_execution_millis: rule.last_execution.map(|dt| dt.timestamp_millis()),
            execution_count: rule.execution_count,
            periodic_execution: rule.periodic_execution,
        })
    }

    /// Recompile this snapshot into a live rule with a fresh instance id.
    pub fn restore(self) -> Result<Rule> {
        let conditions: Vec<serde_json::Value> = serde_json::from_str(&self.conditions_json)
            .map_err(|e| RuleError::Snapshot(e.to_string()))?;
        let actions: Vec<serde_json::Value> = serde_json::from_str(&self.actions_json)
            .map_err(|e| RuleError::Snapshot(e.to_string()))?;

        let document = RuleDocument {
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            conditions,
            actions,
            last_executed: self
                .last_execution_millis
                .and_then(DateTime::from_timestamp_millis),
            execution_count: Some(self.execution_count),
        };
        let mut rule = Rule::compile(self.rule_id, &document)?;
        rule.periodic_execution = self.periodic_execution;
        Ok(rule)
    }
}

/// Serialize the parked rules to the snapshot wire format.
pub fn encode(rules: &[Rule]) -> Result<Vec<u8>> {
    let snapshots = rules
        .iter()
        .map(RuleSnapshot::capture)
        .collect::<Result<Vec<_>>>()?;
    bincode::serialize(&snapshots).map_err(|e| RuleError::Snapshot(e.to_string()))
}

/// Best-effort decode of a snapshot blob.
pub fn decode(bytes: &[u8]) -> Vec<Rule> {
    let snapshots: Vec<RuleSnapshot> = match bincode::deserialize(bytes) {
        Ok(snapshots) => snapshots,
        Err(e) => {
            tracing::warn!("Snapshot blob did not decode; starting clean: {}", e);
            return Vec::new();
        }
    };

    snapshots
        .into_iter()
        .filter_map(|snapshot| {
            let rule_id = snapshot.rule_id.clone();
            match snapshot.restore() {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(rule_id = %rule_id, "Skipping snapshot entry: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rule(rule_id: &str, device_id: &str) -> Rule {
        let document: RuleDocument = serde_json::from_value(json!({
            "name": "sustained occupancy",
            "conditions": [
                {"operation": "occupancy_for", "device_id": device_id, "state": "occupied", "for": 5}
            ],
            "actions": [
                {"type": "send_email", "subject": "s", "body": "b", "to": ["ops@example.com"]}
            ],
            "execution_count": 4
        }))
        .unwrap();
        Rule::compile(rule_id, &document).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_rule_id_set() {
        let parked = vec![sample_rule("rule-a", "occ-1"), sample_rule("rule-b", "occ-2")];
        let bytes = encode(&parked).unwrap();
        let restored = decode(&bytes);

        let mut ids: Vec<_> = restored.iter().map(|r| r.rule_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["rule-a".to_string(), "rule-b".to_string()]);

        // Compiled content is rebuilt, identity is fresh.
        assert_eq!(restored[0].instruction_stream.len(), 1);
        assert_eq!(restored[0].action_stream.len(), 1);
        assert!(restored.iter().all(|r| r.periodic_execution));
        assert_ne!(restored[0].instance_id, parked[0].instance_id);
    }

    #[test]
    fn test_garbage_blob_restores_nothing() {
        assert!(decode(b"not a snapshot").is_empty());
        assert!(decode(&[]).is_empty());
    }

    #[test]
    fn test_uncompilable_entry_is_skipped() {
        let good = sample_rule("rule-a", "occ-1");
        let mut bad = RuleSnapshot::capture(&sample_rule("rule-b", "occ-2")).unwrap();
        bad.conditions_json = r#"[{"operation": "levitate"}]"#.to_string();

        let snapshots = vec![RuleSnapshot::capture(&good).unwrap(), bad];
        let bytes = bincode::serialize(&snapshots).unwrap();

        let restored = decode(&bytes);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].rule_id, "rule-a");
    }

    #[test]
    fn test_execution_metadata_survives() {
        let rule = sample_rule("rule-a", "occ-1");
        let restored = decode(&encode(&[rule]).unwrap());
        assert_eq!(restored[0].execution_count, 4);
    }
}
