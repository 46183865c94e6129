//! Rule Virtual Machine for an IoT device fleet.
//!
//! Compiles declarative rule documents into postfix instruction streams,
//! schedules their evaluation on device events, future deadlines, and
//! rule-store changes, evaluates them against live device state, and
//! dispatches actions. Deferred `FOR`/`AT_TIME` retries live in a persisted
//! future queue so a restart does not drop pending timers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rulevm_engine::Vm;
//! use rulevm_store::{DocumentStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
//!     let vm = Vm::new(store);
//!     vm.start()?;
//!     vm.load_rules_from_store().await?;
//!     vm.restore_snapshot().await;
//!
//!     // Device events re-trigger dependent rules:
//!     vm.execute_all_dependent_rules("sw-1").await;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod error;
pub mod eval;
pub mod instructions;
pub mod rule;
pub mod script;
pub mod snapshot;
pub mod vm;

pub use actions::Action;
pub use error::{Result, RuleError};
pub use eval::evaluate;
pub use instructions::Instruction;
pub use rule::{Rule, IMMEDIATE_RULE_ID};
pub use script::{parse_from_string, parse_rule_script};
pub use snapshot::RuleSnapshot;
pub use vm::{EvalContext, SchedulerHandle, Vm, VmConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
