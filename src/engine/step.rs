//! A single executable step and its sandboxed script execution
//!
//! A [`Step`] couples a Lua script with a structural role inside a sequence
//! (action, branch, loop, try/catch, end) and the metadata the engine needs
//! to run it: a label, a timeout, and the whitelist of context variables the
//! script may read and write.
//!
//! [`Step::execute()`] runs the script in a fresh sandboxed environment with
//! the timeout/termination hooks armed, marshalling the whitelisted variables
//! in before the run and back out after a successful one.

use chrono::{DateTime, Utc};
use mlua::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::comm::{CommChannel, Message, MessageType};
use crate::engine::context::{Context, VariableName, VariableValue};
use crate::engine::{hooks, sandbox};
use crate::error::{TaskError, TaskResult, ABORT_MARKER};

/// Maximum nesting depth a step may be indented to.
pub const MAX_INDENTATION_LEVEL: u16 = 20;

/// Names of the context variables a step imports before its script runs and
/// exports after it finishes.
pub type VariableNames = BTreeSet<VariableName>;

/// Structural role of a step within a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Plain executable step
    Action,
    /// Opens a conditional block
    If,
    /// Alternative branch condition inside an if block
    ElseIf,
    /// Fallback branch inside an if block
    Else,
    /// Opens a loop block
    While,
    /// Opens a protected block
    Try,
    /// Handler branch inside a try block
    Catch,
    /// Closes the innermost open block
    End,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Action => "action",
            StepType::If => "if",
            StepType::ElseIf => "elseif",
            StepType::Else => "else",
            StepType::While => "while",
            StepType::Try => "try",
            StepType::Catch => "catch",
            StepType::End => "end",
        };
        f.write_str(name)
    }
}

/// A single executable unit with a type, a script, a label, and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    step_type: StepType,
    label: String,
    script: String,
    used_context_variable_names: VariableNames,
    timeout: Duration,
    disabled: bool,
    indentation_level: u16,
    time_of_last_execution: Option<DateTime<Utc>>,
    time_of_last_modification: DateTime<Utc>,
}

impl Step {
    /// Create a step of the given type with an empty label and script and no
    /// timeout.
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            label: String::new(),
            script: String::new(),
            used_context_variable_names: VariableNames::new(),
            timeout: Duration::MAX,
            disabled: false,
            indentation_level: 0,
            time_of_last_execution: None,
            time_of_last_modification: Utc::now(),
        }
    }

    /// Structural role of this step.
    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    /// Display label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Script source.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Whitelist of context variables imported and exported by this step.
    pub fn used_context_variable_names(&self) -> &VariableNames {
        &self.used_context_variable_names
    }

    /// Per-execution timeout. `Duration::MAX` means practically unbounded.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a sequence driver should skip this step.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Nesting depth assigned by the sequence indenter.
    pub fn indentation_level(&self) -> u16 {
        self.indentation_level
    }

    /// When this step last started executing, if ever.
    pub fn time_of_last_execution(&self) -> Option<DateTime<Utc>> {
        self.time_of_last_execution
    }

    /// When this step was last modified.
    pub fn time_of_last_modification(&self) -> DateTime<Utc> {
        self.time_of_last_modification
    }

    /// Change the structural role.
    pub fn set_type(&mut self, step_type: StepType) {
        self.step_type = step_type;
        self.time_of_last_modification = Utc::now();
    }

    /// Change the display label.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
        self.time_of_last_modification = Utc::now();
    }

    /// Change the script source.
    pub fn set_script(&mut self, script: impl Into<String>) {
        self.script = script.into();
        self.time_of_last_modification = Utc::now();
    }

    /// Replace the variable whitelist.
    pub fn set_used_context_variable_names(&mut self, names: VariableNames) {
        self.used_context_variable_names = names;
    }

    /// Set the per-execution timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Enable or disable this step.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
        self.time_of_last_modification = Utc::now();
    }

    /// Set the nesting depth. Fails above [`MAX_INDENTATION_LEVEL`].
    pub fn set_indentation_level(&mut self, level: u16) -> TaskResult<()> {
        if level > MAX_INDENTATION_LEVEL {
            return Err(TaskError::Config(format!(
                "Indentation level exceeds maximum ({level} > {MAX_INDENTATION_LEVEL})"
            )));
        }
        self.indentation_level = level;
        Ok(())
    }

    // The sequence indenter clamps its levels into bounds before assignment.
    pub(crate) fn assign_indentation_level(&mut self, level: u16) {
        self.indentation_level = level;
    }

    /// Set the label (builder style).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.set_label(label);
        self
    }

    /// Set the script (builder style).
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.set_script(script);
        self
    }

    /// Set the timeout (builder style).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Set the variable whitelist (builder style).
    pub fn with_used_variables(mut self, names: VariableNames) -> Self {
        self.set_used_context_variable_names(names);
        self
    }

    /// Execute the script of this step within the given context.
    ///
    /// Posts a [`MessageType::StepStarted`] message, builds a fresh sandboxed
    /// environment, arms the timeout/termination hooks, imports the
    /// whitelisted variables, and runs the script under a protected call.
    /// On success the whitelisted variables are exported back into the
    /// context, a [`MessageType::StepStopped`] message is posted, and the
    /// boolean returned by the script (false if it returned none) becomes the
    /// step result. On failure a [`MessageType::StepStoppedWithError`]
    /// message is posted and the call fails with [`TaskError::Abort`] for
    /// timeouts and termination requests, [`TaskError::Script`] otherwise.
    ///
    /// `index` identifies the step within its sequence; it appears in the
    /// posted messages and in error texts.
    pub fn execute(
        &mut self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        index: u64,
    ) -> TaskResult<bool> {
        let now = Utc::now();
        self.time_of_last_execution = Some(now);

        debug!(step = index, "executing step script");
        send_message(comm, MessageType::StepStarted, "Step started", now, index);

        let lua = sandbox::build_sandbox()?;

        if let Some(init) = &context.lua_init_function {
            init(&lua)?;
        }

        hooks::install_periodic_checks(&lua, now, self.timeout, comm.cloned())?;

        self.import_variables(context, &lua)?;

        let eval_result = lua
            .load(self.script.as_str())
            .eval::<Value>()
            .and_then(|value| {
                self.export_variables(&lua, context)?;
                Ok(value)
            });

        match eval_result {
            Ok(value) => {
                let result = match value {
                    Value::Boolean(b) => b,
                    _ => false,
                };

                debug!(step = index, result, "step script finished");
                send_message(
                    comm,
                    MessageType::StepStopped,
                    format!("Step {} finished (logical result: {})", index + 1, result),
                    Utc::now(),
                    index,
                );

                Ok(result)
            }
            Err(e) => {
                let msg = format!(
                    "Error while executing script of step {}: {}",
                    index + 1,
                    e
                );

                warn!(step = index, error = %e, "step script failed");
                send_message(
                    comm,
                    MessageType::StepStoppedWithError,
                    msg.clone(),
                    Utc::now(),
                    index,
                );

                if msg.contains(ABORT_MARKER) {
                    Err(TaskError::Abort(msg))
                } else {
                    Err(TaskError::Script(msg))
                }
            }
        }
    }

    /// Assign each whitelisted variable present in the context to a global of
    /// the same name in the script environment.
    fn import_variables(&self, context: &Context, lua: &mlua::Lua) -> mlua::Result<()> {
        let globals = lua.globals();

        for name in &self.used_context_variable_names {
            let Some(value) = context.variables.get(name) else {
                continue;
            };
            match value {
                VariableValue::Integer(i) => globals.set(name.as_str(), *i)?,
                VariableValue::Float(f) => globals.set(name.as_str(), *f)?,
                VariableValue::Text(s) => globals.set(name.as_str(), s.as_str())?,
            }
        }

        Ok(())
    }

    /// Store each whitelisted global of a recognized type back into the
    /// context. Lua keeps integers and floats apart, so the numeric subtype
    /// survives the round trip; nil and any other type is skipped silently.
    fn export_variables(&self, lua: &mlua::Lua, context: &mut Context) -> mlua::Result<()> {
        let globals = lua.globals();

        for name in &self.used_context_variable_names {
            match globals.get::<_, Value>(name.as_str())? {
                Value::Integer(i) => {
                    context
                        .variables
                        .insert(name.clone(), VariableValue::Integer(i));
                }
                Value::Number(f) => {
                    context
                        .variables
                        .insert(name.clone(), VariableValue::Float(f));
                }
                Value::String(s) => {
                    context
                        .variables
                        .insert(name.clone(), VariableValue::Text(s.to_str()?.to_string()));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn send_message(
    comm: Option<&Arc<CommChannel>>,
    msg_type: MessageType,
    text: impl Into<String>,
    timestamp: DateTime<Utc>,
    step_index: u64,
) {
    if let Some(comm) = comm {
        comm.post(Message::new(msg_type, text, timestamp, step_index));
    }
}
