//! Static name resolution
//!
//! Runs before any code executes so a module referencing unknown names fails
//! without side effects. Globals are module-scoped and locals function-scoped:
//! a name bound anywhere in a scope is visible throughout it.

use std::collections::HashSet;

use super::ast::{Expr, ExprKind, Program};
use super::error::{ResolveError, ScriptError, ScriptResult};

/// Forms handled by the evaluator itself rather than by calling a value.
pub const SPECIAL_FORMS: &[&str] = &[
    "def", "let", "if", "for", "do", "list", "dict", "and", "or", "print", "load",
];

/// Resolve every name used by `program` against the module's own bindings
/// plus `predeclared`.
pub fn resolve_program(program: &Program, predeclared: &HashSet<String>) -> ScriptResult<()> {
    let mut resolver = Resolver {
        filename: &program.name,
        predeclared,
        scopes: Vec::new(),
        errors: Vec::new(),
    };

    let mut globals = HashSet::new();
    for form in &program.forms {
        collect_bindings(form, &mut globals);
    }
    resolver.scopes.push(globals);
    for form in &program.forms {
        if let Some("load") = form.head_symbol() {
            continue;
        }
        resolver.expr(form);
    }

    match resolver.errors.len() {
        0 => Ok(()),
        1 => Err(ScriptError::Resolve(resolver.errors.remove(0))),
        _ => Err(ScriptError::ResolveList(resolver.errors)),
    }
}

/// Names a form binds in the enclosing scope. Does not descend into `def`
/// bodies, which open their own scope.
fn collect_bindings(form: &Expr, out: &mut HashSet<String>) {
    let Some(items) = form.as_list() else {
        return;
    };
    match form.head_symbol() {
        Some("def") | Some("let") => {
            if let Some(name) = items.get(1).and_then(Expr::as_symbol) {
                out.insert(name.to_string());
            }
            if form.head_symbol() == Some("let") {
                for item in items.iter().skip(2) {
                    collect_bindings(item, out);
                }
            }
        }
        Some("for") => {
            if let Some(name) = items.get(1).and_then(Expr::as_symbol) {
                out.insert(name.to_string());
            }
            for item in items.iter().skip(2) {
                collect_bindings(item, out);
            }
        }
        Some("load") => {
            for item in items.iter().skip(2) {
                if let Some(name) = item.as_symbol() {
                    out.insert(name.to_string());
                }
            }
        }
        Some("if") | Some("do") => {
            for item in items.iter().skip(1) {
                collect_bindings(item, out);
            }
        }
        _ => {}
    }
}

struct Resolver<'a> {
    filename: &'a str,
    predeclared: &'a HashSet<String>,
    scopes: Vec<HashSet<String>>,
    errors: Vec<ResolveError>,
}

impl Resolver<'_> {
    fn error(&mut self, expr: &Expr, msg: String) {
        self.errors.push(ResolveError {
            msg,
            filename: self.filename.to_string(),
            pos: expr.pos,
        });
    }

    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name)) || self.predeclared.contains(name)
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Symbol(sym) => {
                let root = sym.split('.').next().unwrap_or(sym);
                if !self.is_bound(root) {
                    self.error(expr, format!("undefined: {}", root));
                }
            }
            ExprKind::Keyword(kw) => {
                self.error(expr, format!("keyword :{} outside of an argument list", kw));
            }
            ExprKind::List(items) => self.list(expr, items),
            _ => {}
        }
    }

    fn list(&mut self, expr: &Expr, items: &[Expr]) {
        let Some(head) = items.first() else {
            self.error(expr, "empty form".to_string());
            return;
        };
        match head.as_symbol() {
            Some("def") => self.def(expr, items),
            Some("let") => {
                if items.len() != 3 || items[1].as_symbol().is_none() {
                    self.error(expr, "let expects (let name value)".to_string());
                    return;
                }
                self.expr(&items[2]);
            }
            Some("for") => {
                if items.len() < 3 || items[1].as_symbol().is_none() {
                    self.error(expr, "for expects (for name iterable body...)".to_string());
                    return;
                }
                for item in &items[2..] {
                    self.expr(item);
                }
            }
            Some("if") => {
                if !(3..=4).contains(&items.len()) {
                    self.error(expr, "if expects (if cond then [else])".to_string());
                    return;
                }
                for item in &items[1..] {
                    self.expr(item);
                }
            }
            Some("load") => {
                self.error(expr, "load is only allowed at the top level of a module".to_string());
            }
            Some(name) if SPECIAL_FORMS.contains(&name) => self.arguments(&items[1..]),
            _ => {
                self.expr(head);
                self.arguments(&items[1..]);
            }
        }
    }

    fn arguments(&mut self, items: &[Expr]) {
        let mut idx = 0;
        while idx < items.len() {
            if let ExprKind::Keyword(kw) = &items[idx].kind {
                match items.get(idx + 1) {
                    Some(value) => self.expr(value),
                    None => self.error(&items[idx], format!("keyword :{} is missing a value", kw)),
                }
                idx += 2;
            } else {
                self.expr(&items[idx]);
                idx += 1;
            }
        }
    }

    fn def(&mut self, expr: &Expr, items: &[Expr]) {
        let params = match (items.get(1).and_then(Expr::as_symbol), items.get(2)) {
            (Some(_), Some(params)) if params.as_list().is_some() => params.as_list().unwrap_or(&[]),
            _ => {
                self.error(expr, "def expects (def name (params...) body...)".to_string());
                return;
            }
        };

        let mut locals = HashSet::new();
        for param in params {
            match &param.kind {
                ExprKind::Symbol(name) => {
                    locals.insert(name.clone());
                }
                ExprKind::List(pair) if pair.len() == 2 && pair[0].as_symbol().is_some() => {
                    // defaults are evaluated in the enclosing scope
                    self.expr(&pair[1]);
                    if let Some(name) = pair[0].as_symbol() {
                        locals.insert(name.to_string());
                    }
                }
                _ => self.error(param, "parameters must be name or (name default)".to_string()),
            }
        }
        for form in &items[3..] {
            collect_bindings(form, &mut locals);
        }

        self.scopes.push(locals);
        for form in &items[3..] {
            self.expr(form);
        }
        self.scopes.pop();
    }
}
