//! Compile-time error types
//!
//! Error codes:
//! - AGG_COMPILE_SCOPE (REJECT)
//! - AGG_COMPILE_DEPTH (REJECT)
//! - AGG_COMPILE_AMBIGUITY (REJECT)
//! - AGG_COMPILE_STRUCTURAL (REJECT)
//!
//! Compile errors are detected eagerly and abort compilation entirely. No
//! partial plan is ever handed to execution.

use thiserror::Error;

/// Errors raised while resolving, validating or staging a query
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    // ==================
    // Resolution
    // ==================
    /// A qualified scope is not a subset of the enclosing scope, or an
    /// expression refers to a dataset outside the query
    #[error("scope error: {0}")]
    Scope(String),

    /// A field, dataset or alias resolves to more than one thing
    #[error("ambiguity error: {0}")]
    Ambiguity(String),

    // ==================
    // Staging
    // ==================
    /// A computation landed at a negative depth or at a depth that is not
    /// yet available
    #[error("depth error: {0}")]
    Depth(String),

    /// The query shape itself is not executable
    #[error("structural error: {0}")]
    Structural(String),
}

impl CompileError {
    /// Shorthand for a scope error
    pub fn scope(message: impl Into<String>) -> Self {
        Self::Scope(message.into())
    }

    /// Shorthand for an ambiguity error
    pub fn ambiguity(message: impl Into<String>) -> Self {
        Self::Ambiguity(message.into())
    }

    /// Shorthand for a depth error
    pub fn depth(message: impl Into<String>) -> Self {
        Self::Depth(message.into())
    }

    /// Shorthand for a structural error
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural(message.into())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Scope(_) => "AGG_COMPILE_SCOPE",
            CompileError::Ambiguity(_) => "AGG_COMPILE_AMBIGUITY",
            CompileError::Depth(_) => "AGG_COMPILE_DEPTH",
            CompileError::Structural(_) => "AGG_COMPILE_STRUCTURAL",
        }
    }

    /// Human-readable message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            CompileError::Scope(m)
            | CompileError::Ambiguity(m)
            | CompileError::Depth(m)
            | CompileError::Structural(m) => m,
        }
    }
}

/// Result type for compilation
pub type CompileResult<T> = Result<T, CompileError>;
