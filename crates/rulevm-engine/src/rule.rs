//! Rules: compiled condition/action pairs with their device dependencies.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use rulevm_store::RuleDocument;

use crate::actions::Action;
use crate::error::Result;
use crate::instructions::Instruction;

/// Rule id used by ad-hoc script rules; never persisted back to the store.
pub const IMMEDIATE_RULE_ID: &str = "immediate";

/// A compiled rule.
///
/// `rule_id` is the stable document id; `instance_id` is fresh for every
/// scheduled evaluation so a deferred clone and its parent can be told
/// apart in the awaiting-completion list.
#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_id: String,
    pub instance_id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Raw condition entries as stored.
    pub conditions: Vec<Value>,
    /// Raw action entries as stored.
    pub actions: Vec<Value>,
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
    /// Whether deferred self-rescheduling is allowed.
    pub periodic_execution: bool,
    /// Postfix instruction stream.
    pub instruction_stream: Vec<Instruction>,
    pub action_stream: Vec<Action>,
    /// Devices whose events re-trigger this rule.
    pub dependent_devices: Vec<String>,
}

impl Rule {
    /// Compile a stored rule document. Any condition or action entry that
    /// fails validation aborts compilation of this rule only.
    pub fn compile(rule_id: impl Into<String>, document: &RuleDocument) -> Result<Self> {
        let instruction_stream = compile_conditions(&document.conditions)?;
        let action_stream = compile_actions(&document.actions)?;
        let dependent_devices = collect_dependent_devices(&instruction_stream);

        let rule = Self {
            rule_id: rule_id.into(),
            instance_id: Uuid::new_v4(),
            name: document.name.clone(),
            description: document.description.clone(),
            enabled: document.enabled,
            conditions: document.conditions.clone(),
            actions: document.actions.clone(),
            last_execution: document.last_executed,
            execution_count: document.execution_count.unwrap_or(0),
            periodic_execution: true,
            instruction_stream,
            action_stream,
            dependent_devices,
        };
        tracing::debug!(
            rule_id = %rule.rule_id,
            dependent_devices = ?rule.dependent_devices,
            "Compiled rule"
        );
        Ok(rule)
    }

    /// Compile an ad-hoc rule from raw condition entries. Immediate rules
    /// never re-park themselves and never write execution metadata back.
    pub fn immediate(conditions: Vec<Value>) -> Result<Self> {
        let document = RuleDocument {
            name: "One shot rule".to_string(),
            description: "Ad-hoc rule created through the VM API".to_string(),
            enabled: true,
            conditions,
            actions: Vec::new(),
            last_executed: None,
            execution_count: None,
        };
        let mut rule = Self::compile(IMMEDIATE_RULE_ID, &document)?;
        rule.periodic_execution = false;
        Ok(rule)
    }

    pub fn is_immediate(&self) -> bool {
        self.rule_id == IMMEDIATE_RULE_ID
    }

    /// Whether a state change of `device_id` can change this rule's result.
    pub fn depends_on(&self, device_id: &str) -> bool {
        self.dependent_devices.iter().any(|d| d == device_id)
    }

    /// Copy of this rule with a fresh `instance_id`.
    ///
    /// Every scheduled evaluation gets its own instance; reusing the
    /// parent's id would let the parent's post-evaluation cleanup evict a
    /// still-pending deferred child from the awaiting list.
    pub fn clone_for_reschedule(&self) -> Self {
        let mut clone = self.clone();
        clone.instance_id = Uuid::new_v4();
        clone
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Rule({}): {}>", self.instance_id, self.rule_id)
    }
}

fn compile_conditions(conditions: &[Value]) -> Result<Vec<Instruction>> {
    let mut stream = Vec::with_capacity(conditions.len());
    for entry in conditions {
        stream.push(Instruction::parse(entry)?);
    }
    Ok(infix_to_postfix(stream))
}

fn compile_actions(actions: &[Value]) -> Result<Vec<Action>> {
    actions.iter().map(Action::parse).collect()
}

/// Infix to postfix conversion.
///
/// The authoring surface is a flat list interleaving operands and binary
/// operators; `AND` and `OR` have equal precedence, associate left, and
/// there are no parentheses. The operator stack therefore never holds more
/// than one entry: a new operator flushes the previous one to the output.
fn infix_to_postfix(stream: Vec<Instruction>) -> Vec<Instruction> {
    let mut stack: Vec<Instruction> = Vec::new();
    let mut output = Vec::with_capacity(stream.len());

    for instruction in stream {
        if instruction.is_operator() {
            if let Some(previous) = stack.pop() {
                output.push(previous);
            }
            stack.push(instruction);
        } else {
            output.push(instruction);
        }
    }

    output.extend(stack);
    output
}

fn collect_dependent_devices(stream: &[Instruction]) -> Vec<String> {
    let mut devices: Vec<String> = Vec::new();
    for instruction in stream {
        if let Some(device_id) = instruction.device_id() {
            if !devices.iter().any(|d| d == device_id) {
                devices.push(device_id.to_string());
            }
        }
    }
    devices
}
