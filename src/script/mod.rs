//! Embedded scripting language used to describe enclave plans.
//!
//! Scripts are S-expressions with Starlark-like semantics: modules define
//! globals with `def`/`let`, functions take positional and `:keyword`
//! arguments, and every name is resolved before any code runs. Hosts inject
//! their own namespace (the "predeclared" names) and receive one of a small
//! set of failure shapes when something goes wrong.

/// Abstract syntax tree definitions.
pub mod ast;
/// Universe builtins (`len`, `fail`, arithmetic, ...).
pub mod builtins;
/// Failure shapes raised by each phase.
pub mod error;
/// Parser for module source text.
pub mod parser;
/// Static name resolution.
pub mod resolve;
/// Evaluator and per-module execution context.
pub mod runtime;
/// Script values.
pub mod value;

pub use ast::{Expr, ExprKind, Position, Program};
pub use error::{
    EvalError, NativeError, ResolveError, ScriptError, ScriptResult, StackFrame, SyntaxError,
};
pub use parser::parse_program;
pub use runtime::{LoadHook, PrintHook, TOO_MANY_STEPS_MSG, Thread, call, exec_file};
pub use value::{
    Function, Globals, Kwargs, Module, Namespace, NativeFn, NativeFunction, NativeObject, Param,
    StructValue, Value, bind_args, expect_string,
};
