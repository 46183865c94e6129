//! Actions fired by passing rules.
//!
//! Each action is self-contained and validated at construction time, like
//! the instructions. Action failures are logged by the VM and never feed
//! back into evaluation.

pub mod email;
pub mod relay;

use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::vm::EvalContext;

pub use email::SendEmailAction;
pub use relay::ChangeRelayStateAction;

/// One compiled action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendEmail(SendEmailAction),
    ChangeRelayState(ChangeRelayStateAction),
}

impl Action {
    /// Construct and validate an action from a raw action entry.
    pub fn parse(entry: &Value) -> Result<Self> {
        let tag = entry
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuleError::validation("action", "missing `type` field"))?
            .to_ascii_lowercase();

        match tag.as_str() {
            "send_email" => Ok(Self::SendEmail(SendEmailAction::parse(entry)?)),
            "change_relay_state" => {
                Ok(Self::ChangeRelayState(ChangeRelayStateAction::parse(entry)?))
            }
            other => Err(RuleError::UnknownAction(other.to_string())),
        }
    }

    /// Canonical action tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "SEND_EMAIL",
            Self::ChangeRelayState(_) => "CHANGE_RELAY_STATE",
        }
    }

    /// Run this action to completion.
    pub async fn perform(&self, ctx: &EvalContext) -> Result<()> {
        match self {
            Self::SendEmail(action) => action.perform().await,
            Self::ChangeRelayState(action) => action.perform(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_matching_is_case_insensitive() {
        let action = Action::parse(&json!({
            "type": "CHANGE_RELAY_STATE",
            "device_id": "sw-1",
            "relay_index": 1,
            "state": 0
        }))
        .unwrap();
        assert_eq!(action.kind(), "CHANGE_RELAY_STATE");
    }

    #[test]
    fn test_unknown_action_is_typed() {
        let err = Action::parse(&json!({"type": "play_siren"})).unwrap_err();
        assert!(matches!(err, RuleError::UnknownAction(tag) if tag == "play_siren"));
    }

    #[test]
    fn test_missing_type_field() {
        let err = Action::parse(&json!({"subject": "hi"})).unwrap_err();
        assert!(matches!(err, RuleError::Validation { .. }));
    }
}
