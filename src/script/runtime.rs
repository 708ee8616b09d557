//! Evaluator for parsed and resolved modules
//!
//! A [`Thread`] is the execution context of one module run: it owns the call
//! stack used for diagnostics, the step counter, and the `print`/`load`
//! hooks. Hosts create a fresh thread per module so call stacks never
//! accumulate across independent executions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use super::ast::{Expr, ExprKind, Position};
use super::builtins::universe;
use super::error::{EvalError, NativeError, ScriptError, ScriptResult, StackFrame};
use super::parser::parse_program;
use super::resolve::resolve_program;
use super::value::{Function, Globals, Kwargs, ModuleEnv, Namespace, Param, Value};

/// Hook invoked by the `print` statement.
pub type PrintHook = Box<dyn Fn(&Thread, &str) -> Result<(), NativeError>>;

/// Hook invoked by the `load` statement; returns the loaded module's globals.
pub type LoadHook = Box<dyn Fn(&Thread, &str) -> Result<Namespace, NativeError>>;

const TOPLEVEL_FRAME: &str = "<toplevel>";
const BUILTIN_FILE: &str = "<builtin>";

/// Message used when the step budget of a thread runs out.
pub const TOO_MANY_STEPS_MSG: &str = "Starlark computation cancelled: too many steps";

/// Per-module execution context.
pub struct Thread {
    /// Thread name; hosts use the module locator.
    pub name: String,
    steps: u64,
    max_steps: Option<u64>,
    stack: Vec<StackFrame>,
    active: Vec<Rc<Function>>,
    print: Option<PrintHook>,
    load: Option<LoadHook>,
}

impl Thread {
    /// Create a thread with no step limit and default hooks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: 0,
            max_steps: None,
            stack: Vec::new(),
            active: Vec::new(),
            print: None,
            load: None,
        }
    }

    /// Abort evaluation once more than `max_steps` expressions ran.
    pub fn with_max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Install the `print` hook.
    pub fn with_print(mut self, hook: PrintHook) -> Self {
        self.print = Some(hook);
        self
    }

    /// Install the `load` hook.
    pub fn with_load(mut self, hook: LoadHook) -> Self {
        self.load = Some(hook);
        self
    }

    /// Expressions evaluated so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// File of the innermost script frame. Native functions use it to find
    /// the module that called them.
    pub fn current_module(&self) -> &str {
        self.stack
            .iter()
            .rev()
            .find(|frame| frame.filename != BUILTIN_FILE)
            .map(|frame| frame.filename.as_str())
            .unwrap_or(&self.name)
    }

    fn snapshot(&self, cause: String) -> EvalError {
        EvalError {
            cause,
            call_stack: self.stack.clone(),
        }
    }

    fn set_pos(&mut self, pos: Position) {
        if let Some(top) = self.stack.last_mut() {
            top.pos = pos;
        }
    }
}

/// Parse, resolve and execute a module, returning its globals.
pub fn exec_file(
    thread: &mut Thread,
    filename: &str,
    source: &str,
    predeclared: &Namespace,
) -> ScriptResult<Globals> {
    let program = parse_program(filename, source).map_err(ScriptError::Syntax)?;

    let mut scope = universe();
    scope.extend(predeclared.iter().map(|(k, v)| (k.clone(), v.clone())));
    let names: HashSet<String> = scope.keys().cloned().collect();
    resolve_program(&program, &names)?;

    let env = Rc::new(ModuleEnv {
        globals: Default::default(),
        predeclared: scope,
    });

    thread.stack.push(StackFrame {
        name: TOPLEVEL_FRAME.to_string(),
        filename: filename.to_string(),
        pos: Position::default(),
    });
    let mut eval = Evaluator {
        thread: &mut *thread,
        env: env.clone(),
        locals: None,
        filename: filename.to_string(),
    };
    let result = program
        .forms
        .iter()
        .try_for_each(|form| eval.exec_toplevel(form).map(|_| ()));
    thread.stack.pop();

    result.map_err(ScriptError::Eval)?;
    Ok(Globals(env))
}

/// Call a callable value with positional and keyword arguments.
pub fn call(
    thread: &mut Thread,
    callee: &Value,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    call_value(thread, callee, args, kwargs).map_err(ScriptError::Eval)
}

fn call_value(
    thread: &mut Thread,
    callee: &Value,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, EvalError> {
    match callee {
        Value::Function(func) => call_function(thread, func, args, kwargs),
        Value::Builtin(native) => {
            thread.stack.push(StackFrame {
                name: native.name().to_string(),
                filename: BUILTIN_FILE.to_string(),
                pos: Position::default(),
            });
            let result = native
                .call(thread, args, kwargs)
                .map_err(|err| thread.snapshot(err.0));
            thread.stack.pop();
            result
        }
        other => Err(thread.snapshot(format!(
            "invalid call of non-function ({})",
            other.type_name()
        ))),
    }
}

fn call_function(
    thread: &mut Thread,
    func: &Rc<Function>,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, EvalError> {
    let env = func.module.upgrade().ok_or_else(|| {
        thread.snapshot(format!(
            "function {} outlived the module that defined it",
            func.name
        ))
    })?;

    let locals = bind_params(func, args, kwargs).map_err(|msg| thread.snapshot(msg))?;

    // a function defined once is the same function however it was reached
    if thread
        .active
        .iter()
        .any(|running| running.filename == func.filename && running.pos == func.pos)
    {
        return Err(thread.snapshot(format!("function {} called recursively", func.name)));
    }

    thread.active.push(Rc::clone(func));
    thread.stack.push(StackFrame {
        name: func.name.clone(),
        filename: func.filename.clone(),
        pos: func.pos,
    });
    let mut eval = Evaluator {
        thread: &mut *thread,
        env,
        locals: Some(locals),
        filename: func.filename.clone(),
    };
    let result = eval.body(&func.body);
    thread.stack.pop();
    thread.active.pop();
    result
}

fn bind_params(
    func: &Function,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<HashMap<String, Value>, String> {
    if args.len() > func.params.len() {
        return Err(format!(
            "function {} accepts at most {} positional arguments ({} given)",
            func.name,
            func.params.len(),
            args.len()
        ));
    }
    let mut bound: Vec<Option<Value>> = vec![None; func.params.len()];
    for (slot, value) in bound.iter_mut().zip(args) {
        *slot = Some(value);
    }
    for (key, value) in kwargs {
        let idx = func
            .params
            .iter()
            .position(|p| p.name == key)
            .ok_or_else(|| format!("function {} got an unexpected keyword argument '{}'", func.name, key))?;
        if bound[idx].is_some() {
            return Err(format!(
                "function {} got multiple values for parameter '{}'",
                func.name, key
            ));
        }
        bound[idx] = Some(value);
    }

    let mut locals = HashMap::new();
    let mut missing = Vec::new();
    for (param, slot) in func.params.iter().zip(bound) {
        match slot.or_else(|| param.default.clone()) {
            Some(value) => {
                locals.insert(param.name.clone(), value);
            }
            None => missing.push(param.name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(format!(
            "function {} missing {} argument(s): {}",
            func.name,
            missing.len(),
            missing.join(", ")
        ));
    }
    Ok(locals)
}

struct Evaluator<'t> {
    thread: &'t mut Thread,
    env: Rc<ModuleEnv>,
    locals: Option<HashMap<String, Value>>,
    filename: String,
}

type EvalResult = Result<Value, EvalError>;

impl Evaluator<'_> {
    fn raise(&mut self, pos: Position, msg: impl Into<String>) -> EvalError {
        self.thread.set_pos(pos);
        self.thread.snapshot(msg.into())
    }

    fn exec_toplevel(&mut self, form: &Expr) -> EvalResult {
        if form.head_symbol() == Some("load") {
            return self.load(form);
        }
        self.eval(form)
    }

    fn body(&mut self, forms: &[Expr]) -> EvalResult {
        let mut last = Value::None;
        for form in forms {
            last = self.eval(form)?;
        }
        Ok(last)
    }

    fn tick(&mut self, pos: Position) -> Result<(), EvalError> {
        self.thread.steps += 1;
        if let Some(max) = self.thread.max_steps {
            if self.thread.steps > max {
                return Err(self.raise(pos, TOO_MANY_STEPS_MSG));
            }
        }
        Ok(())
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.locals.as_mut() {
            Some(locals) => {
                locals.insert(name.to_string(), value);
            }
            None => {
                self.env.globals.borrow_mut().insert(name.to_string(), value);
            }
        }
    }

    fn lookup(&mut self, name: &str, pos: Position) -> EvalResult {
        if let Some(locals) = &self.locals {
            if let Some(value) = locals.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.env.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.env.predeclared.get(name) {
            return Ok(value.clone());
        }
        Err(self.raise(pos, format!("variable {} referenced before assignment", name)))
    }

    fn eval(&mut self, expr: &Expr) -> EvalResult {
        self.tick(expr.pos)?;
        match &expr.kind {
            ExprKind::Integer(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Boolean(b) => Ok(Value::Bool(*b)),
            ExprKind::String(s) => Ok(Value::String(s.clone())),
            ExprKind::Symbol(sym) => self.symbol(sym, expr.pos),
            ExprKind::Keyword(kw) => {
                Err(self.raise(expr.pos, format!("unexpected keyword :{}", kw)))
            }
            ExprKind::List(items) => self.form(expr, items),
        }
    }

    fn symbol(&mut self, sym: &str, pos: Position) -> EvalResult {
        if sym == "None" {
            return Ok(Value::None);
        }
        let mut parts = sym.split('.');
        let root = parts.next().unwrap_or(sym);
        let mut value = self.lookup(root, pos)?;
        for part in parts {
            value = match value.attr(part) {
                Some(next) => next,
                None => {
                    return Err(self.raise(
                        pos,
                        format!("{} has no .{} field or method", value.type_name(), part),
                    ));
                }
            };
        }
        Ok(value)
    }

    fn form(&mut self, expr: &Expr, items: &[Expr]) -> EvalResult {
        let Some(head) = items.first() else {
            return Err(self.raise(expr.pos, "empty form"));
        };
        match head.as_symbol() {
            Some("def") => self.def(expr, items),
            Some("let") => {
                let value = self.eval(&items[2])?;
                if let Some(name) = items[1].as_symbol() {
                    self.bind(name, value);
                }
                Ok(Value::None)
            }
            Some("if") => {
                if self.eval(&items[1])?.truthy() {
                    self.eval(&items[2])
                } else if let Some(otherwise) = items.get(3) {
                    self.eval(otherwise)
                } else {
                    Ok(Value::None)
                }
            }
            Some("for") => self.for_loop(expr, items),
            Some("do") => self.body(&items[1..]),
            Some("list") => {
                let values = items[1..]
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(values))
            }
            Some("dict") => {
                let (args, kwargs) = self.arguments(&items[1..])?;
                if !args.is_empty() {
                    return Err(self.raise(expr.pos, "dict entries must be :key value pairs"));
                }
                Ok(Value::Dict(kwargs.into_iter().collect::<BTreeMap<_, _>>()))
            }
            Some("and") => {
                let mut last = Value::Bool(true);
                for item in &items[1..] {
                    last = self.eval(item)?;
                    if !last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Some("or") => {
                let mut last = Value::Bool(false);
                for item in &items[1..] {
                    last = self.eval(item)?;
                    if last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Some("print") => self.print(expr, items),
            Some("load") => Err(self.raise(expr.pos, "load is only allowed at the top level")),
            _ => {
                let callee = self.eval(head)?;
                let (args, kwargs) = self.arguments(&items[1..])?;
                self.thread.set_pos(expr.pos);
                call_value(self.thread, &callee, args, kwargs)
            }
        }
    }

    fn arguments(&mut self, items: &[Expr]) -> Result<(Vec<Value>, Kwargs), EvalError> {
        let mut args = Vec::new();
        let mut kwargs: Kwargs = Vec::new();
        let mut idx = 0;
        while idx < items.len() {
            if let ExprKind::Keyword(key) = &items[idx].kind {
                let Some(value_expr) = items.get(idx + 1) else {
                    return Err(self.raise(items[idx].pos, format!("keyword :{} is missing a value", key)));
                };
                let value = self.eval(value_expr)?;
                kwargs.push((key.clone(), value));
                idx += 2;
            } else {
                if !kwargs.is_empty() {
                    return Err(self.raise(items[idx].pos, "positional argument follows keyword argument"));
                }
                args.push(self.eval(&items[idx])?);
                idx += 1;
            }
        }
        Ok((args, kwargs))
    }

    fn def(&mut self, expr: &Expr, items: &[Expr]) -> EvalResult {
        let name = items[1].as_symbol().unwrap_or_default().to_string();
        let mut params = Vec::new();
        for param in items[2].as_list().unwrap_or(&[]) {
            match &param.kind {
                ExprKind::Symbol(pname) => params.push(Param {
                    name: pname.clone(),
                    default: None,
                }),
                ExprKind::List(pair) => {
                    let default = self.eval(&pair[1])?;
                    params.push(Param {
                        name: pair[0].as_symbol().unwrap_or_default().to_string(),
                        default: Some(default),
                    });
                }
                _ => return Err(self.raise(param.pos, "malformed parameter")),
            }
        }
        let func = Function {
            name: name.clone(),
            filename: self.filename.clone(),
            pos: expr.pos,
            params,
            body: items[3..].to_vec(),
            module: Rc::downgrade(&self.env),
        };
        self.bind(&name, Value::Function(Rc::new(func)));
        Ok(Value::None)
    }

    fn for_loop(&mut self, expr: &Expr, items: &[Expr]) -> EvalResult {
        let name = items[1].as_symbol().unwrap_or_default().to_string();
        let iterable = self.eval(&items[2])?;
        let elements = match iterable {
            Value::List(values) => values,
            Value::Dict(map) => map.into_keys().map(Value::String).collect(),
            other => {
                return Err(self.raise(
                    expr.pos,
                    format!("{} value is not iterable", other.type_name()),
                ));
            }
        };
        for element in elements {
            self.bind(&name, element);
            self.body(&items[3..])?;
        }
        Ok(Value::None)
    }

    fn print(&mut self, expr: &Expr, items: &[Expr]) -> EvalResult {
        let (args, kwargs) = self.arguments(&items[1..])?;
        if !kwargs.is_empty() {
            return Err(self.raise(expr.pos, "print does not accept keyword arguments"));
        }
        let line = args
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.thread.set_pos(expr.pos);
        let outcome = match &self.thread.print {
            Some(hook) => hook(self.thread, &line),
            None => {
                tracing::info!(thread = %self.thread.name, "{}", line);
                Ok(())
            }
        };
        outcome.map_err(|err| self.raise(expr.pos, err.0))?;
        Ok(Value::None)
    }

    fn load(&mut self, form: &Expr) -> EvalResult {
        let items = form.as_list().unwrap_or(&[]);
        let module = match items.get(1).map(|e| &e.kind) {
            Some(ExprKind::String(module)) => module.clone(),
            _ => return Err(self.raise(form.pos, "load expects a module string")),
        };
        self.thread.set_pos(form.pos);
        let loaded = match &self.thread.load {
            Some(hook) => hook(self.thread, &module),
            None => Err(NativeError::new("load not implemented by this application")),
        };
        let loaded = loaded.map_err(|err| self.raise(form.pos, err.0))?;
        for item in &items[2..] {
            let Some(name) = item.as_symbol() else {
                return Err(self.raise(item.pos, "load expects symbol names"));
            };
            let Some(value) = loaded.get(name).cloned() else {
                return Err(self.raise(item.pos, format!("load: name {} not found in module {}", name, module)));
            };
            self.bind(name, value);
        }
        Ok(Value::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> ScriptResult<Globals> {
        let mut thread = Thread::new("main.star");
        exec_file(&mut thread, "main.star", src, &Namespace::new())
    }

    #[test]
    fn rejects_recursion() {
        let err = run("(def f (n) (f n))\n(let x (f 1))").unwrap_err();
        let ScriptError::Eval(err) = err else {
            panic!("expected eval error");
        };
        assert_eq!(err.cause, "function f called recursively");

        let err = run("(def even (n) (odd n))\n(def odd (n) (even n))\n(let x (even 3))").unwrap_err();
        assert!(matches!(err, ScriptError::Eval(e) if e.cause == "function even called recursively"));
    }

    #[test]
    fn repeated_calls_are_not_recursion() {
        let globals = run("(def inc (n) (+ n 1))\n(let x (inc (inc (inc 1))))").unwrap();
        assert_eq!(globals.get("x"), Some(Value::Int(4)));
    }

    #[test]
    fn defines_and_calls_functions() {
        let globals = run("(def add (a (b 10)) (+ a b))\n(let x (add 1))\n(let y (add 1 :b 2))").unwrap();
        assert_eq!(globals.get("x"), Some(Value::Int(11)));
        assert_eq!(globals.get("y"), Some(Value::Int(3)));
    }

    #[test]
    fn functions_see_globals_defined_later() {
        let globals = run("(def f () limit)\n(let limit 5)\n(let out (f))").unwrap();
        assert_eq!(globals.get("out"), Some(Value::Int(5)));
    }

    #[test]
    fn loops_and_conditionals() {
        let src = "(let total 0)\n(for i (range 4) (let total (+ total i)))\n(let big (if (> total 5) \"yes\" \"no\"))";
        let globals = run(src).unwrap();
        assert_eq!(globals.get("total"), Some(Value::Int(6)));
        assert_eq!(globals.get("big"), Some(Value::String("yes".into())));
    }

    #[test]
    fn eval_errors_carry_the_call_stack() {
        let src = "(def inner () (fail \"boom\"))\n(def outer () (inner))\n(outer)";
        let err = run(src).unwrap_err();
        let ScriptError::Eval(err) = err else {
            panic!("expected eval error, got {:?}", err);
        };
        assert_eq!(err.cause, "fail: boom");
        let names: Vec<&str> = err.call_stack.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["<toplevel>", "outer", "inner", "fail"]);
        assert_eq!(err.call_stack[0].pos, Position::new(3, 1));
        assert_eq!(err.call_stack[3].filename, "<builtin>");
    }

    #[test]
    fn builtins_see_the_calling_module() {
        let mut predeclared = Namespace::new();
        predeclared.insert(
            "whereami".into(),
            Value::builtin("whereami", |thread, _, _| {
                Ok(Value::String(thread.current_module().to_string()))
            }),
        );
        let mut thread = Thread::new("thread-name");
        let globals = exec_file(&mut thread, "lib.star", "(let here (whereami))", &predeclared).unwrap();
        assert_eq!(globals.get("here"), Some(Value::String("lib.star".into())));
        assert_eq!(thread.current_module(), "thread-name");
    }

    #[test]
    fn step_limit_aborts_evaluation() {
        let mut thread = Thread::new("main.star").with_max_steps(Some(20));
        let err = exec_file(
            &mut thread,
            "main.star",
            "(for i (range 100) (+ i 1))",
            &Namespace::new(),
        )
        .unwrap_err();
        let ScriptError::Eval(err) = err else {
            panic!("expected eval error");
        };
        assert_eq!(err.cause, TOO_MANY_STEPS_MSG);
    }

    #[test]
    fn print_hook_can_reject() {
        let mut thread = Thread::new("main.star")
            .with_print(Box::new(|_, _| Err(NativeError::new("no printing"))));
        let err = exec_file(&mut thread, "main.star", "(print \"hi\")", &Namespace::new())
            .unwrap_err();
        let ScriptError::Eval(err) = err else {
            panic!("expected eval error");
        };
        assert_eq!(err.cause, "no printing");
    }

    #[test]
    fn calls_entry_function_with_keywords() {
        let globals = run("(def run (a b) (list a b))").unwrap();
        let entry = globals.get("run").unwrap();
        let mut thread = Thread::new("main.star");
        let out = call(
            &mut thread,
            &entry,
            vec![],
            vec![("b".into(), Value::Int(2)), ("a".into(), Value::Int(1))],
        )
        .unwrap();
        assert_eq!(out, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }
}
