//! Error types for the taskomat engine

use thiserror::Error;

/// Marker prefix carried by errors raised to forcibly terminate a script.
///
/// Errors whose message starts with this marker originate from a timeout or a
/// termination request. They must not be swallowed by user-level try/catch
/// handling; a sequence driver unwinds past its catch blocks when it sees one.
pub const ABORT_MARKER: &str = "[ABORT]";

/// Main error type for the taskomat engine
///
/// All variants format as their bare message because the message texts are
/// part of the observable surface (they travel over the comm channel and are
/// matched by drivers).
#[derive(Error, Debug)]
pub enum TaskError {
    /// The steps of a sequence are not properly nested
    #[error("{0}")]
    Structural(String),

    /// A step script failed with an ordinary runtime or syntax error
    #[error("{0}")]
    Script(String),

    /// A step script was forcibly terminated; the message carries [`ABORT_MARKER`]
    #[error("{0}")]
    Abort(String),

    /// Invalid configuration: labels, indentation levels, variable names
    #[error("{0}")]
    Config(String),
}

impl TaskError {
    /// Check whether this error resulted from a timeout or termination request.
    pub fn is_abort(&self) -> bool {
        matches!(self, TaskError::Abort(_))
    }
}

impl From<mlua::Error> for TaskError {
    fn from(err: mlua::Error) -> Self {
        let msg = err.to_string();
        if msg.contains(ABORT_MARKER) {
            TaskError::Abort(msg)
        } else {
            TaskError::Script(msg)
        }
    }
}

/// Result type alias for the taskomat engine
pub type TaskResult<T> = Result<T, TaskError>;
