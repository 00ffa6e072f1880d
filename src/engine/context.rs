//! Caller-owned variable store shared with step scripts
//!
//! A [`Context`] carries the variables that survive across step executions.
//! Before a script runs, the executor copies the step's whitelisted variables
//! from the context into the Lua environment; after a successful run it copies
//! them back. Only integers, floats, and strings cross this bridge.

use mlua::Lua;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{TaskError, TaskResult};

/// Name of a variable exchanged between a [`Context`] and a script environment.
///
/// Must be a non-empty identifier: an ASCII letter or underscore followed by
/// ASCII letters, digits, or underscores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableName(String);

impl VariableName {
    /// Create a variable name, validating the identifier rules.
    pub fn new(name: impl Into<String>) -> TaskResult<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };

        if !valid {
            return Err(TaskError::Config(format!(
                "Invalid variable name \"{name}\""
            )));
        }

        Ok(Self(name))
    }

    /// View the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for VariableName {
    type Error = TaskError;

    fn try_from(name: &str) -> TaskResult<Self> {
        Self::new(name)
    }
}

/// A typed value that can cross the bridge between a context and a script.
///
/// Integers and floats are distinct variants; any other script-side type is
/// ignored on export. Booleans and compound types deliberately do not cross
/// the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    /// Signed 64-bit integer
    Integer(i64),
    /// IEEE-754 double
    Float(f64),
    /// UTF-8 string
    Text(String),
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Float(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Text(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Text(value)
    }
}

/// Hook invoked once per script environment, after the sandbox is built and
/// before the step script runs. Callers use it to install custom functions.
pub type LuaInitFn = Arc<dyn Fn(&Lua) -> mlua::Result<()> + Send + Sync>;

/// Caller-owned variable store plus an optional script environment initializer.
///
/// The executor borrows the context for the duration of one
/// [`Step::execute()`](crate::Step::execute) call and mutates it only when
/// exporting variables after a successful run.
#[derive(Clone, Default)]
pub struct Context {
    /// Variables visible to steps that list them in their whitelist
    pub variables: HashMap<VariableName, VariableValue>,

    /// Optional initializer applied to every fresh script environment
    pub lua_init_function: Option<LuaInitFn>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable (builder style).
    pub fn with_variable(mut self, name: VariableName, value: impl Into<VariableValue>) -> Self {
        self.variables.insert(name, value.into());
        self
    }

    /// Set the script environment initializer (builder style).
    pub fn with_init_function<F>(mut self, f: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<()> + Send + Sync + 'static,
    {
        self.lua_init_function = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("variables", &self.variables)
            .field("has_init_function", &self.lua_init_function.is_some())
            .finish()
    }
}
