//! Document shapes stored for devices and rules.
//!
//! Field names follow the wire format the fleet already publishes
//! (camelCase where the dashboard wrote them, snake_case elsewhere).
//! Unrecognized fields are preserved through a flattened map so a partial
//! reader never drops data on write-back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A device document as stored in the `devices` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDocument {
    /// Per-relay on/off state, zero-indexed.
    #[serde(rename = "relayStatus", default, skip_serializing_if = "Vec::is_empty")]
    pub relay_status: Vec<i64>,
    /// Single-relay devices mirror their state here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_state: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparent_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Who wrote the last relay update.
    #[serde(rename = "insertedBy", default, skip_serializing_if = "Option::is_none")]
    pub inserted_by: Option<String>,
    /// Fields this reader does not model.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DeviceDocument {
    /// Named meter variable, if the device reports it.
    pub fn meter_value(&self, variable: &str) -> Option<f64> {
        match variable {
            "voltage" => self.voltage,
            "current" => self.current,
            "real_power" => self.real_power,
            "apparent_power" => self.apparent_power,
            "power_factor" => self.power_factor,
            "frequency" => self.frequency,
            "energy" => self.energy,
            _ => None,
        }
    }
}

/// One record of the `generatedData` subcollection of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedData {
    /// When the device produced this record (UTC).
    pub creation_timestamp: DateTime<Utc>,
    /// Door/window position for contact sensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Remaining fields, including the one-based `relay1..relayN` keys.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl GeneratedData {
    /// New record with the given timestamp and nothing else.
    pub fn at(creation_timestamp: DateTime<Utc>) -> Self {
        Self {
            creation_timestamp,
            status: None,
            temperature: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the zero-indexed relay to a 0/1 state (stored under the
    /// one-based `relayN` wire key).
    pub fn with_relay(mut self, relay_index: usize, state: i64) -> Self {
        self.extra.insert(
            format!("relay{}", relay_index + 1),
            serde_json::Value::from(state),
        );
        self
    }

    /// State of the zero-indexed relay, if present.
    pub fn relay(&self, relay_index: usize) -> Option<i64> {
        self.extra
            .get(&format!("relay{}", relay_index + 1))
            .and_then(|v| v.as_i64())
    }
}

/// A rule document as stored in the `rules` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Raw condition entries; compiled by the engine.
    pub conditions: Vec<serde_json::Value>,
    /// Raw action entries; compiled by the engine.
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// Shallow-merge `patch`'s top-level keys over a serialized document.
///
/// Mirrors the partial-update semantics of a document store: the caller
/// patches a handful of fields and everything else survives untouched.
pub fn apply_patch<T>(doc: &T, patch: &serde_json::Value) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(doc)?;
    match (value.as_object_mut(), patch.as_object()) {
        (Some(target), Some(fields)) => {
            for (key, field) in fields {
                target.insert(key.clone(), field.clone());
            }
        }
        _ => {
            return Err(Error::InvalidInput(
                "patch and document must both be JSON objects".to_string(),
            ));
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_document_wire_names() {
        let doc: DeviceDocument = serde_json::from_value(serde_json::json!({
            "relayStatus": [1, 0],
            "voltage": 229.5,
            "insertedBy": "dashboard",
            "firmware": "2.1.0"
        }))
        .unwrap();
        assert_eq!(doc.relay_status, vec![1, 0]);
        assert_eq!(doc.meter_value("voltage"), Some(229.5));
        assert_eq!(doc.inserted_by.as_deref(), Some("dashboard"));
        assert!(doc.extra.contains_key("firmware"));
    }

    #[test]
    fn test_generated_data_relay_keys_are_one_based() {
        let record = GeneratedData::at(Utc::now()).with_relay(0, 1).with_relay(3, 0);
        assert!(record.extra.contains_key("relay1"));
        assert!(record.extra.contains_key("relay4"));
        assert_eq!(record.relay(0), Some(1));
        assert_eq!(record.relay(3), Some(0));
        assert_eq!(record.relay(1), None);
    }

    #[test]
    fn test_rule_document_defaults() {
        let doc: RuleDocument = serde_json::from_value(serde_json::json!({
            "name": "night lights",
            "conditions": [{"operation": "at_time", "time": "18:00:00+00:00"}]
        }))
        .unwrap();
        assert!(doc.enabled);
        assert!(doc.actions.is_empty());
        assert!(doc.execution_count.is_none());
    }

    #[test]
    fn test_apply_patch_keeps_unmentioned_fields() {
        let doc = DeviceDocument {
            relay_status: vec![1, 1],
            voltage: Some(230.0),
            ..Default::default()
        };
        let patched: DeviceDocument = apply_patch(
            &doc,
            &serde_json::json!({"relay_state": 0, "insertedBy": "dashboard"}),
        )
        .unwrap();
        assert_eq!(patched.relay_state, Some(0));
        assert_eq!(patched.inserted_by.as_deref(), Some("dashboard"));
        assert_eq!(patched.relay_status, vec![1, 1]);
        assert_eq!(patched.voltage, Some(230.0));
    }

    #[test]
    fn test_apply_patch_rejects_non_object() {
        let doc = DeviceDocument::default();
        assert!(apply_patch(&doc, &serde_json::json!(7)).is_err());
    }
}
