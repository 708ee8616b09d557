//! Error types for the plan engine
//!
//! Every script-execution failure surfaces to callers as a single
//! [`InterpretationError`]. Collaborators (package providers, storage) keep
//! their own `thiserror` enums and convert at the boundary.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::script::{EvalError, ResolveError, ScriptError, SyntaxError};

/// Banner used when several resolution errors are reported at once.
pub const MULTIPLE_INTERPRETATION_ERRORS_MSG: &str =
    "Multiple errors caught interpreting the Starlark script. Listing each of them below.";

/// Prefix carried by every evaluation error message.
pub const EVALUATION_ERROR_PREFIX: &str = "Evaluation error: ";

/// Frames and resolution errors with this name come from the import helper
/// itself and are hidden from script authors.
pub const SKIP_IMPORT_INSTRUCTION_IN_STACKTRACE: &str = "import_module";

/// Location of a frame inside a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPosition {
    /// Module locator.
    pub filename: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl ScriptPosition {
    /// Build a position.
    pub fn new(filename: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for ScriptPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.filename, self.line, self.col)
    }
}

/// One frame of an interpretation stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Frame message: a function name for evaluation errors, the error text
    /// for syntax and resolution errors.
    pub name: String,
    /// Where the frame points.
    pub position: ScriptPosition,
}

impl CallFrame {
    /// Build a frame.
    pub fn new(name: impl Into<String>, position: ScriptPosition) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// The one caller-visible failure of interpreting a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretationError {
    message: Option<String>,
    stacktrace: Vec<CallFrame>,
}

impl InterpretationError {
    /// Error with a message and no stack trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stacktrace: Vec::new(),
        }
    }

    /// Error made only of stack frames.
    pub fn from_stacktrace(stacktrace: Vec<CallFrame>) -> Self {
        Self {
            message: None,
            stacktrace,
        }
    }

    /// Error with both a fixed message and stack frames.
    pub fn with_custom_msg(stacktrace: Vec<CallFrame>, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stacktrace,
        }
    }

    /// Top-level message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Frames, outermost first.
    pub fn stacktrace(&self) -> &[CallFrame] {
        &self.stacktrace
    }
}

impl fmt::Display for InterpretationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        for (idx, frame) in self.stacktrace.iter().enumerate() {
            if idx > 0 || self.message.is_some() {
                writeln!(f)?;
            }
            write!(f, "\tat {}: {}", frame.position, frame.name)?;
        }
        Ok(())
    }
}

impl std::error::Error for InterpretationError {}

/// Convenience result alias for interpretation.
pub type InterpretationResult<T> = std::result::Result<T, InterpretationError>;

/// Failure raised while running a script, before normalization.
#[derive(Debug, Clone)]
pub enum RaisedFailure {
    /// Single binding/resolution error.
    Resolve(ResolveError),
    /// Single syntax error.
    Syntax(SyntaxError),
    /// Several resolution errors.
    ResolveList(Vec<ResolveError>),
    /// Evaluation error with its call stack.
    Eval(EvalError),
    /// Already normalized.
    Structured(InterpretationError),
    /// Anything else, by its text.
    Unknown(String),
}

impl From<ScriptError> for RaisedFailure {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Syntax(e) => RaisedFailure::Syntax(e),
            ScriptError::Resolve(e) => RaisedFailure::Resolve(e),
            ScriptError::ResolveList(errors) => RaisedFailure::ResolveList(errors),
            ScriptError::Eval(e) => RaisedFailure::Eval(e),
            other @ ScriptError::Internal(_) => RaisedFailure::Unknown(other.to_string()),
        }
    }
}

impl From<InterpretationError> for RaisedFailure {
    fn from(err: InterpretationError) -> Self {
        RaisedFailure::Structured(err)
    }
}

impl From<ScriptError> for InterpretationError {
    fn from(err: ScriptError) -> Self {
        translate(err)
    }
}

/// Normalize any raised failure into an [`InterpretationError`].
pub fn translate(failure: impl Into<RaisedFailure>) -> InterpretationError {
    match failure.into() {
        RaisedFailure::Resolve(e) => InterpretationError::from_stacktrace(vec![CallFrame::new(
            e.msg,
            ScriptPosition::new(e.filename, e.pos.line, e.pos.col),
        )]),
        RaisedFailure::Syntax(e) => InterpretationError::from_stacktrace(vec![CallFrame::new(
            e.msg,
            ScriptPosition::new(e.filename, e.pos.line, e.pos.col),
        )]),
        RaisedFailure::ResolveList(errors) => {
            let stacktrace = errors
                .into_iter()
                .filter(|e| e.msg != SKIP_IMPORT_INSTRUCTION_IN_STACKTRACE)
                .map(|e| {
                    CallFrame::new(e.msg, ScriptPosition::new(e.filename, e.pos.line, e.pos.col))
                })
                .collect();
            InterpretationError::with_custom_msg(stacktrace, MULTIPLE_INTERPRETATION_ERRORS_MSG)
        }
        RaisedFailure::Eval(e) => {
            let stacktrace = e
                .call_stack
                .into_iter()
                .filter(|frame| frame.name != SKIP_IMPORT_INSTRUCTION_IN_STACKTRACE)
                .map(|frame| {
                    CallFrame::new(
                        frame.name,
                        ScriptPosition::new(frame.filename, frame.pos.line, frame.pos.col),
                    )
                })
                .collect();
            let message = if e.cause.starts_with(EVALUATION_ERROR_PREFIX) {
                e.cause
            } else {
                format!("{}{}", EVALUATION_ERROR_PREFIX, e.cause)
            };
            InterpretationError::with_custom_msg(stacktrace, message)
        }
        RaisedFailure::Structured(e) => e,
        RaisedFailure::Unknown(text) => InterpretationError::new(format!("UnknownError: {}\n", text)),
    }
}

/// Errors raised by package content providers.
#[derive(Debug, Error)]
pub enum PackageError {
    /// No module with that locator.
    #[error("Module '{0}' not found")]
    ModuleNotFound(String),

    /// Relative locator escapes the package root.
    #[error("Locator '{locator}' escapes the root of package '{package_id}'")]
    InvalidLocator {
        /// Package the locator was resolved in.
        package_id: String,
        /// Offending locator.
        locator: String,
    },

    /// A replacement package could not be materialized.
    #[error("Replacement package '{replacement}' for '{package}' is unavailable")]
    ReplacementUnavailable {
        /// Package being replaced.
        package: String,
        /// Package it is replaced with.
        replacement: String,
    },

    /// IO error
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl From<PackageError> for InterpretationError {
    fn from(err: PackageError) -> Self {
        InterpretationError::new(err.to_string())
    }
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
