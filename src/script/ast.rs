use serde::{Deserialize, Serialize};
use std::fmt;

/// Line/column location inside a script, both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub col: u32,
}

impl Position {
    /// Build a position from explicit coordinates.
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Generic S-expression nodes used throughout the script language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ExprKind {
    /// A bare symbol, possibly dotted (`plan.add_service`).
    Symbol(String),
    /// Keyword tokens (leading colon) marking keyword arguments.
    Keyword(String),
    /// String literal.
    String(String),
    /// Signed integer literal.
    Integer(i64),
    /// Floating-point literal.
    Float(f64),
    /// Boolean literal.
    Boolean(bool),
    /// Nested list.
    List(Vec<Expr>),
}

/// A node together with where it starts in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Node payload.
    pub kind: ExprKind,
    /// Source location of the first character of the node.
    pub pos: Position,
}

impl Expr {
    /// Wrap a node payload with its position.
    pub fn new(kind: ExprKind, pos: Position) -> Self {
        Self { kind, pos }
    }

    /// Symbol text when the node is a symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    /// Child nodes when the node is a list.
    pub fn as_list(&self) -> Option<&[Expr]> {
        match &self.kind {
            ExprKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Head symbol of a list form, e.g. `def` for `(def run (plan) ...)`.
    pub fn head_symbol(&self) -> Option<&str> {
        self.as_list()
            .and_then(|items| items.first())
            .and_then(Expr::as_symbol)
    }
}

/// Parsed module. `name` is the module locator the source was loaded under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Module locator used in diagnostics.
    pub name: String,
    /// Parsed top-level forms.
    pub forms: Vec<Expr>,
    /// Original source text, retained for error reporting and debugging.
    pub source: String,
}

impl Program {
    /// Construct a program from its locator, source and forms.
    pub fn new(name: impl Into<String>, source: impl Into<String>, forms: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            forms,
        }
    }
}
