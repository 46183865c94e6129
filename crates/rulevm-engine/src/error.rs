//! Error types for the rule engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RuleError>;

/// Errors raised while compiling or evaluating rules.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Condition entry names an operation outside the instruction set.
    #[error("Incorrect/Unknown operation: {0}")]
    UnknownOperation(String),

    /// Action entry names a type outside the action set.
    #[error("Incorrect/Unknown action type: {0}")]
    UnknownAction(String),

    /// Operand or action data failed construction-time validation.
    #[error("Validation error in {operation}: {message}")]
    Validation { operation: String, message: String },

    /// Store read/write failure during evaluation.
    #[error("Store error: {0}")]
    Store(#[from] rulevm_store::Error),

    /// Evaluation failure (stack underflow, missing device fields).
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Action execution failure.
    #[error("Action failed: {0}")]
    Action(String),

    /// Snapshot encode/decode failure.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Scheduler lifecycle misuse.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Rule script line did not match any instruction pattern.
    #[error("Script parse error on line {line}: {message}")]
    Script { line: usize, message: String },
}

impl RuleError {
    /// Validation error for the given opcode or action tag.
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<RuleError> for rulevm_core::Error {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Store(inner) => inner.into(),
            RuleError::UnknownOperation(_)
            | RuleError::UnknownAction(_)
            | RuleError::Validation { .. } => rulevm_core::Error::Validation(e.to_string()),
            RuleError::Script { .. } => rulevm_core::Error::Parse(e.to_string()),
            _ => rulevm_core::Error::Other(anyhow::anyhow!(e)),
        }
    }
}
