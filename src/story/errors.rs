//! Story Errors
//!
//! Error types for the runtime: the public `StoryError` surfaced by the
//! embedding API, the severity classes routed through the story's error
//! handler, and the internal `RuntimeFault` used to unwind a single step
//! back to the continue loop.

use thiserror::Error;

/// Severity classes reported through `Story::set_error_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Author-visible hints emitted from the ink source.
    Author,
    /// Recoverable anomaly; execution continues.
    Warning,
    /// Fatal for the current continue; the state is force-ended.
    Error,
}

/// Errors surfaced by the embedding API.
#[derive(Error, Debug)]
pub enum StoryError {
    #[error("Story JSON could not be parsed: {0}")]
    BadJson(String),

    #[error("ink version number not found. Are you sure it's a valid .ink.json file?")]
    MissingVersion,

    #[error("Version of ink used to build story was newer than the current version of the engine")]
    VersionTooNew,

    #[error("Version of ink used to build story is too old to be loaded by this version of the engine")]
    VersionTooOld,

    #[error("Root node for ink not found. Are you sure it's a valid .ink.json file?")]
    MissingRoot,

    #[error("ink save format incorrect, can't load.")]
    MissingSaveVersion,

    #[error("Ink save format isn't compatible with the current version (saw '{found}', but minimum is {minimum}), so can't load.")]
    IncompatibleSaveVersion { found: i64, minimum: i64 },

    /// API misuse: bad arguments, calls while an async continue is active,
    /// unknown functions or flows.
    #[error("{0}")]
    InvalidOperation(String),

    /// Accumulated story errors at the end of a continue with no error
    /// handler registered.
    #[error("{0}")]
    Unhandled(String),
}

/// A fatal fault raised while stepping. The continue loop converts it into
/// a formatted state error and force-ends the story.
#[derive(Debug, Clone)]
pub struct RuntimeFault {
    pub message: String,
    /// Report the fault at the end line of the offending construct rather
    /// than its start.
    pub use_end_line_number: bool,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> RuntimeFault {
        RuntimeFault { message: message.into(), use_end_line_number: false }
    }

    pub fn at_end_line(message: impl Into<String>) -> RuntimeFault {
        RuntimeFault { message: message.into(), use_end_line_number: true }
    }
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_version_message() {
        let err = StoryError::IncompatibleSaveVersion { found: 7, minimum: 8 };
        assert!(err.to_string().contains("saw '7'"));
        assert!(err.to_string().contains("minimum is 8"));
    }

    #[test]
    fn test_fault_end_line_flag() {
        assert!(!RuntimeFault::new("x").use_end_line_number);
        assert!(RuntimeFault::at_end_line("x").use_end_line_number);
    }
}
