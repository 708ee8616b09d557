//! Failure shapes raised by the script runtime
//!
//! Each phase of running a module fails in its own way: the parser reports a
//! single syntax error, the resolver one or many unbound names, and the
//! evaluator a cause plus the call stack at the point of failure.

use std::fmt;
use thiserror::Error;

use super::ast::Position;

/// Parse failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{filename}:{pos}: {msg}")]
pub struct SyntaxError {
    /// Human readable reason.
    pub msg: String,
    /// Module the source was loaded under.
    pub filename: String,
    /// Where the parser stopped.
    pub pos: Position,
}

/// Name-binding failure found before any code runs.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{filename}:{pos}: {msg}")]
pub struct ResolveError {
    /// Human readable reason.
    pub msg: String,
    /// Module the source was loaded under.
    pub filename: String,
    /// Position of the offending symbol.
    pub pos: Position,
}

/// One entry of an evaluation call stack, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    /// Function name, `<toplevel>` for module code, or a builtin's name.
    pub name: String,
    /// File the frame executes in (`<builtin>` for native functions).
    pub filename: String,
    /// Current position within the frame.
    pub pos: Position,
}

/// Runtime failure with the call stack captured when it was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    /// Message of the underlying failure.
    pub cause: String,
    /// Frames from outermost to innermost.
    pub call_stack: Vec<StackFrame>,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        for frame in &self.call_stack {
            write!(f, "\n\t{}:{}: in {}", frame.filename, frame.pos, frame.name)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvalError {}

/// Error type returned by native functions; the evaluator attaches the stack.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    /// Build a native error from any displayable message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Everything `exec_file` and `call` can fail with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// The source did not parse.
    #[error("{0}")]
    Syntax(SyntaxError),

    /// Exactly one unbound name.
    #[error("{0}")]
    Resolve(ResolveError),

    /// Several unbound names.
    #[error("{} resolution errors", .0.len())]
    ResolveList(Vec<ResolveError>),

    /// Evaluation raised.
    #[error("{0}")]
    Eval(EvalError),

    /// Runtime invariant broken (e.g. a function outlived its module).
    #[error("internal script runtime error: {0}")]
    Internal(String),
}

/// Convenience result alias for script runtime operations.
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;
