use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use super::ast::{Expr, Position};
use super::error::NativeError;
use super::runtime::Thread;

/// Name → value mapping used for predeclared names and module globals.
pub type Namespace = BTreeMap<String, Value>;

/// Keyword arguments in call order.
pub type Kwargs = Vec<(String, Value)>;

/// Script value. Dict keys are restricted to strings.
#[derive(Clone)]
pub enum Value {
    /// Absence of a value.
    None,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed dictionary, iterated in key order.
    Dict(BTreeMap<String, Value>),
    /// Typed record built by a type constructor or `struct`.
    Struct(Rc<StructValue>),
    /// Function defined by the script.
    Function(Rc<Function>),
    /// Function implemented natively.
    Builtin(Rc<dyn NativeFunction>),
    /// Natively implemented object exposing attributes.
    Object(Rc<dyn NativeObject>),
    /// Globals of an imported module.
    Module(Rc<Module>),
}

/// Record value with a type name and named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    /// Constructor name, e.g. `ServiceConfig`.
    pub type_name: String,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
}

/// Declared parameter of a script function.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Default value, evaluated when the function was defined.
    pub default: Option<Value>,
}

/// Function defined with `(def name (params...) body...)`.
pub struct Function {
    /// Function name.
    pub name: String,
    /// Module the function was defined in.
    pub filename: String,
    /// Position of the `def` form.
    pub pos: Position,
    /// Declared parameters in order.
    pub params: Vec<Param>,
    /// Body forms; the value of the last one is returned.
    pub body: Vec<Expr>,
    /// Environment of the defining module. Weak so module globals holding
    /// the function do not form a reference cycle.
    pub(crate) module: Weak<ModuleEnv>,
}

impl Function {
    /// Number of declared parameters.
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Name of the parameter at `index`.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|p| p.name.as_str())
    }
}

/// Natively implemented callable.
pub trait NativeFunction {
    /// Name used in call stacks and error messages.
    fn name(&self) -> &str;

    /// Invoke the function.
    fn call(&self, thread: &mut Thread, args: Vec<Value>, kwargs: Kwargs)
    -> Result<Value, NativeError>;
}

/// Natively implemented object with attribute access (`plan.add_service`).
pub trait NativeObject {
    /// Type name reported by `type` errors.
    fn type_name(&self) -> &str;

    /// Look up an attribute.
    fn attr(&self, name: &str) -> Option<Value>;
}

type NativeFnBody = dyn Fn(&mut Thread, Vec<Value>, Kwargs) -> Result<Value, NativeError>;

/// Closure-backed [`NativeFunction`].
pub struct NativeFn {
    name: String,
    body: Box<NativeFnBody>,
}

impl NativeFn {
    /// Wrap a closure as a native function.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Thread, Vec<Value>, Kwargs) -> Result<Value, NativeError> + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

impl NativeFunction for NativeFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        thread: &mut Thread,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, NativeError> {
        (self.body)(thread, args, kwargs)
    }
}

/// Everything module code can see: its own globals plus the predeclared
/// names (universe builtins overlaid with the caller's namespace).
#[derive(Debug, Default)]
pub(crate) struct ModuleEnv {
    pub(crate) globals: RefCell<Namespace>,
    pub(crate) predeclared: Namespace,
}

/// Module globals handed out by `exec_file`.
#[derive(Clone, Debug, Default)]
pub struct Globals(pub(crate) Rc<ModuleEnv>);

impl Globals {
    /// Fetch a global by name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.globals.borrow().get(name).cloned()
    }

    /// Whether a global with this name exists.
    pub fn has(&self, name: &str) -> bool {
        self.0.globals.borrow().contains_key(name)
    }

    /// Names of all globals, sorted.
    pub fn names(&self) -> Vec<String> {
        self.0.globals.borrow().keys().cloned().collect()
    }
}

/// Imported module value.
pub struct Module {
    /// Module locator.
    pub name: String,
    /// Globals the module defined.
    pub globals: Globals,
}

impl Value {
    /// Wrap a closure as a builtin value.
    pub fn builtin<F>(name: impl Into<String>, body: F) -> Value
    where
        F: Fn(&mut Thread, Vec<Value>, Kwargs) -> Result<Value, NativeError> + 'static,
    {
        Value::Builtin(Rc::new(NativeFn::new(name, body)))
    }

    /// Build a struct value.
    pub fn new_struct(type_name: impl Into<String>, fields: BTreeMap<String, Value>) -> Value {
        Value::Struct(Rc::new(StructValue {
            type_name: type_name.into(),
            fields,
        }))
    }

    /// Type name as reported in error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::String(_) => "string".into(),
            Value::List(_) => "list".into(),
            Value::Dict(_) => "dict".into(),
            Value::Struct(s) => s.type_name.clone(),
            Value::Function(_) => "function".into(),
            Value::Builtin(_) => "builtin_function_or_method".into(),
            Value::Object(o) => o.type_name().to_string(),
            Value::Module(_) => "module".into(),
        }
    }

    /// Truthiness used by `if`, `and`, `or` and `not`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Whether the value can be invoked.
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Builtin(_))
    }

    /// Convenience accessor for string references.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Attribute lookup for dotted access.
    pub fn attr(&self, name: &str) -> Option<Value> {
        match self {
            Value::Struct(s) => s.fields.get(name).cloned(),
            Value::Module(m) => m.globals.get(name),
            Value::Object(o) => o.attr(name),
            _ => None,
        }
    }

    /// Quoted representation, as used inside containers.
    pub fn repr(&self) -> String {
        match self {
            Value::String(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", inner.join(", "))
            }
            Value::Dict(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{:?}: {}", k, v.repr()))
                    .collect();
                write!(f, "{{{}}}", inner.join(", "))
            }
            Value::Struct(s) => {
                let inner: Vec<String> = s
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.repr()))
                    .collect();
                write!(f, "{}({})", s.type_name, inner.join(", "))
            }
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name()),
            Value::Object(o) => write!(f, "<{}>", o.type_name()),
            Value::Module(m) => write!(f, "<module {}>", m.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (Value::Object(a), Value::Object(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Bind native call arguments against a parameter list.
///
/// Parameter names ending in `?` are optional. Positional arguments fill
/// parameters in order, keyword arguments by name.
pub fn bind_args(
    fn_name: &str,
    params: &[&str],
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Vec<Option<Value>>, NativeError> {
    if args.len() > params.len() {
        return Err(NativeError::new(format!(
            "{}: got {} positional arguments, want at most {}",
            fn_name,
            args.len(),
            params.len()
        )));
    }
    let names: Vec<&str> = params.iter().map(|p| p.trim_end_matches('?')).collect();
    let mut bound: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in bound.iter_mut().zip(args) {
        *slot = Some(value);
    }
    for (key, value) in kwargs {
        let idx = names.iter().position(|n| *n == key).ok_or_else(|| {
            NativeError::new(format!("{}: unexpected keyword argument '{}'", fn_name, key))
        })?;
        if bound[idx].is_some() {
            return Err(NativeError::new(format!(
                "{}: got multiple values for parameter '{}'",
                fn_name, key
            )));
        }
        bound[idx] = Some(value);
    }
    for (param, slot) in params.iter().zip(&bound) {
        if slot.is_none() && !param.ends_with('?') {
            return Err(NativeError::new(format!(
                "{}: missing argument for {}",
                fn_name, param
            )));
        }
    }
    Ok(bound)
}

/// Extract a string argument.
pub fn expect_string(fn_name: &str, param: &str, value: Value) -> Result<String, NativeError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(NativeError::new(format!(
            "{}: for parameter {}: got {}, want string",
            fn_name,
            param,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_positional_then_keyword_arguments() {
        let bound = bind_args(
            "f",
            &["a", "b", "c?"],
            vec![Value::Int(1)],
            vec![("b".into(), Value::Int(2))],
        )
        .unwrap();
        assert_eq!(bound, vec![Some(Value::Int(1)), Some(Value::Int(2)), None]);
    }

    #[test]
    fn rejects_missing_and_duplicate_arguments() {
        let err = bind_args("f", &["a"], vec![], vec![]).unwrap_err();
        assert_eq!(err.0, "f: missing argument for a");

        let err = bind_args(
            "f",
            &["a"],
            vec![Value::Int(1)],
            vec![("a".into(), Value::Int(2))],
        )
        .unwrap_err();
        assert!(err.0.contains("multiple values"));
    }

    #[test]
    fn displays_nested_values() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::List(vec![Value::Int(1), Value::String("x".into())]));
        assert_eq!(Value::Dict(map).to_string(), r#"{"k": [1, "x"]}"#);
        assert_eq!(Value::Bool(true).to_string(), "True");
    }
}
