//! Enclave Plan – script interpretation with history-aware plan reconciliation
//!
//! This crate interprets declarative enclave scripts and computes which of
//! the instructions they describe actually need to run:
//! - A small S-expression scripting language with Starlark-like semantics
//! - Recursive, cached module imports across packages
//! - Structured, stack-annotated interpretation errors
//! - Reconciliation of freshly generated plans against persisted enclave history

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Plan engine: interpreter, plans, masks and reconciliation
pub mod engine;
/// Embedded scripting language
pub mod script;

// Re-export key types for convenience
pub use engine::{
    EnclavePlan, Interpretation, InterpretationError, InterpretRequest, Interpreter,
    InterpreterConfig,
};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
