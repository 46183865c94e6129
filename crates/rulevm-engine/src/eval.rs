//! Postfix stack evaluator.
//!
//! Operands are pushed unevaluated; an operator pops two entries and forces
//! whichever of them is still an instruction. Evaluation is strict: both
//! operands of every operator are evaluated, there is no short-circuit.

use crate::error::{Result, RuleError};
use crate::instructions::Instruction;
use crate::rule::Rule;
use crate::vm::EvalContext;

enum Entry<'a> {
    Value(bool),
    Operand(&'a Instruction),
}

async fn force(entry: Entry<'_>, rule: &Rule, ctx: &EvalContext) -> Result<bool> {
    match entry {
        Entry::Value(value) => Ok(value),
        Entry::Operand(instruction) => instruction.evaluate(rule, ctx).await,
    }
}

fn underflow(rule: &Rule) -> RuleError {
    RuleError::Evaluation(format!("instruction stream of {} underflows the stack", rule))
}

/// Evaluate a rule's postfix instruction stream to its truth value.
pub async fn evaluate(rule: &Rule, ctx: &EvalContext) -> Result<bool> {
    let mut stack: Vec<Entry<'_>> = Vec::new();

    for instruction in &rule.instruction_stream {
        match instruction {
            Instruction::LogicalAnd | Instruction::LogicalOr => {
                let rhs = stack.pop().ok_or_else(|| underflow(rule))?;
                let lhs = stack.pop().ok_or_else(|| underflow(rule))?;
                let lhs = force(lhs, rule, ctx).await?;
                let rhs = force(rhs, rule, ctx).await?;
                let value = match instruction {
                    Instruction::LogicalAnd => lhs && rhs,
                    _ => lhs || rhs,
                };
                tracing::debug!(op = instruction.opcode(), lhs, rhs, value, "Folded operator");
                stack.push(Entry::Value(value));
            }
            operand => stack.push(Entry::Operand(operand)),
        }
    }

    let last = stack
        .pop()
        .ok_or_else(|| RuleError::Evaluation(format!("{} has an empty instruction stream", rule)))?;
    force(last, rule, ctx).await
}
