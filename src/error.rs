//! Provides [InterpretationError], the error that most things return.
use thiserror::Error;

/// Any error that can occur while interpreting Von source code.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error.
    #[error("compile-time error")]
    CompileError,
    /// A runtime error, such as a type error or calling a non-callable.
    #[error("runtime error")]
    RuntimeError,
}
