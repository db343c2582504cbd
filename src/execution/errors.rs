//! Execution error types
//!
//! Error codes:
//! - AGG_EXEC_RESOURCE_EXHAUSTED (ERROR)
//! - AGG_EXEC_CONSISTENCY (FATAL)
//! - AGG_EXEC_MALFORMED_COMMAND (REJECT)
//! - AGG_EXEC_ENGINE (ERROR)
//!
//! Any execution error aborts the whole session. Dataset handles are
//! released before the error reaches the caller.

use thiserror::Error;

use crate::language::CompileError;
use crate::plan::WireError;

/// Result type for execution
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Result type for calls into the external engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by the external engine for one dataset
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Memory, stat or group limits exceeded
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other engine failure
    #[error("engine failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    // ==================
    // Engine
    // ==================
    /// The engine ran out of resources while serving a command
    #[error("resource exhausted on dataset '{dataset}': {message}")]
    ResourceExhausted { dataset: String, message: String },

    /// The engine failed while serving a command
    #[error("engine failure on dataset '{dataset}': {message}")]
    Engine { dataset: String, message: String },

    // ==================
    // Session
    // ==================
    /// Session state contradicts itself: unbalanced push stack, merge
    /// disagreement, regroup below the root
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A command cannot be executed as written
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// A command's expressions failed to lower for some dataset
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl ExecutionError {
    /// Attach the dataset an engine error came from
    pub fn engine(dataset: &str, err: EngineError) -> Self {
        match err {
            EngineError::ResourceExhausted(message) => ExecutionError::ResourceExhausted {
                dataset: dataset.to_string(),
                message,
            },
            EngineError::Failed(message) => ExecutionError::Engine {
                dataset: dataset.to_string(),
                message,
            },
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        ExecutionError::Consistency(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        ExecutionError::MalformedCommand(message.into())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::ResourceExhausted { .. } => "AGG_EXEC_RESOURCE_EXHAUSTED",
            ExecutionError::Engine { .. } => "AGG_EXEC_ENGINE",
            ExecutionError::Consistency(_) => "AGG_EXEC_CONSISTENCY",
            ExecutionError::MalformedCommand(_) => "AGG_EXEC_MALFORMED_COMMAND",
            ExecutionError::Compile(err) => err.code(),
        }
    }

    /// Programming-error-class faults
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Consistency(_))
    }
}

impl From<WireError> for ExecutionError {
    fn from(err: WireError) -> Self {
        ExecutionError::MalformedCommand(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_carry_dataset() {
        let err = ExecutionError::engine("jobsearch", EngineError::ResourceExhausted("too many stats".into()));
        assert_eq!(err.code(), "AGG_EXEC_RESOURCE_EXHAUSTED");
        assert!(err.to_string().contains("jobsearch"));

        let err = ExecutionError::engine("mobsearch", EngineError::Failed("gone".into()));
        assert_eq!(err.code(), "AGG_EXEC_ENGINE");
    }

    #[test]
    fn test_wire_error_is_malformed_command() {
        let err: ExecutionError = WireError::Decode("eof".into()).into();
        assert_eq!(err.code(), "AGG_EXEC_MALFORMED_COMMAND");
    }

    #[test]
    fn test_compile_error_keeps_its_code() {
        let err: ExecutionError = CompileError::scope("no such dataset").into();
        assert_eq!(err.code(), "AGG_COMPILE_SCOPE");
        assert!(!err.is_fatal());
        assert!(ExecutionError::consistency("stack").is_fatal());
    }
}
