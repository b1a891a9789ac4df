//! Error types for the question-flow core.
//!
//! Only structural and data errors live here. Failures of the external AI
//! capabilities never surface as errors; they are folded into
//! [`crate::outcome::Outcome::Degraded`] by the policy and the controller.

use crate::flow::FlowPhase;

/// Contract violations by the caller or a desynchronised state store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// Rehydrated state does not fit the loaded question bank.
    #[error("Invalid conversation state: {0}")]
    InvalidState(String),
    /// A question was selected that is not in the unused set.
    #[error("Question {index} cannot be selected: it is not unused")]
    InvalidSelection { index: usize },
    /// A step function was called in the wrong lifecycle phase.
    #[error("Operation '{operation}' is not valid in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: FlowPhase,
    },
}

/// Failures while loading a question bank.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read question bank '{source_name}': {error}")]
    Io {
        source_name: String,
        #[source]
        error: std::io::Error,
    },
    #[error("Failed to parse question bank '{source_name}': {error}")]
    Parse {
        source_name: String,
        #[source]
        error: serde_json::Error,
    },
    #[error("Row {row} is missing required field '{field}'")]
    MissingField { row: usize, field: &'static str },
    #[error("Question bank contains no usable questions")]
    Empty,
}
