//! Taskomat - Sandboxed Step Execution Engine
//!
//! A library for executing user-authored sequences of steps, where each step
//! carries a small Lua script and a structural role (action, branch, loop,
//! try/catch, end).
//!
//! # Features
//!
//! - Per-step Lua 5.4 execution in a fresh sandboxed environment with a
//!   whitelisted standard library subset
//! - Wall-clock timeouts and cooperative cancellation enforced from inside
//!   the VM, piercing user-level `pcall`
//! - Typed variable marshalling between a host [`Context`] and the script
//!   environment with exact integer/float discrimination
//! - Structural validation of sequences: indentation levels and nesting
//!   errors for `if`/`while`/`try` blocks
//! - Lifecycle messages delivered to observers over a shared [`CommChannel`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use taskomat::{Context, Step, StepType, VariableName};
//!
//! let mut step = Step::new(StepType::Action);
//! step.set_script("c = a + b; return true");
//! step.set_used_context_variable_names(
//!     [
//!         VariableName::new("a")?,
//!         VariableName::new("b")?,
//!         VariableName::new("c")?,
//!     ]
//!     .into(),
//! );
//!
//! let mut context = Context::new()
//!     .with_variable(VariableName::new("a")?, 3i64)
//!     .with_variable(VariableName::new("b")?, 4i64);
//!
//! let result = step.execute(&mut context, None, 0)?;
//! assert!(result);
//! # Ok::<(), taskomat::TaskError>(())
//! ```

pub mod engine;
mod error;

// Re-exports
pub use engine::comm::{CommChannel, Message, MessageType};
pub use engine::context::{Context, LuaInitFn, VariableName, VariableValue};
pub use engine::sequence::{Sequence, StepIndex, MAX_LABEL_LENGTH};
pub use engine::step::{Step, StepType, VariableNames, MAX_INDENTATION_LEVEL};
pub use engine::timeout::TimeoutTrigger;
pub use error::{TaskError, TaskResult, ABORT_MARKER};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CommChannel, Context, Message, MessageType, Sequence, Step, StepIndex, StepType,
        TaskError, TaskResult, TimeoutTrigger, VariableName, VariableNames, VariableValue,
    };
}
