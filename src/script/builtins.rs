//! Universe builtins available to every module.

use std::cmp::Ordering;

use super::error::NativeError;
use super::value::{Kwargs, Namespace, Value, bind_args};

/// Longest string `*` may build by repetition, in bytes.
pub const MAX_REPEAT_LEN: usize = 1 << 20;

/// Names predeclared in every module before host bindings are applied.
pub fn universe() -> Namespace {
    let mut ns = Namespace::new();
    let mut add = |name: &str, value: Value| {
        ns.insert(name.to_string(), value);
    };

    add("len", Value::builtin("len", |_, args, kwargs| {
        let [value] = single("len", args, kwargs)?;
        let len = match &value {
            Value::String(s) => s.chars().count(),
            Value::List(items) => items.len(),
            Value::Dict(map) => map.len(),
            other => {
                return Err(NativeError::new(format!("len: value of type {} has no len", other.type_name())));
            }
        };
        Ok(Value::Int(len as i64))
    }));

    add("str", Value::builtin("str", |_, args, kwargs| {
        let [value] = single("str", args, kwargs)?;
        Ok(Value::String(value.to_string()))
    }));

    add("int", Value::builtin("int", |_, args, kwargs| {
        let [value] = single("int", args, kwargs)?;
        match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| NativeError::new(format!("int: invalid literal {:?}", s))),
            other => Err(NativeError::new(format!("int: cannot convert {} to int", other.type_name()))),
        }
    }));

    add("not", Value::builtin("not", |_, args, kwargs| {
        let [value] = single("not", args, kwargs)?;
        Ok(Value::Bool(!value.truthy()))
    }));

    add("fail", Value::builtin("fail", |_, args, kwargs| {
        let bound = bind_args("fail", &["msg"], args, kwargs)?;
        let msg = bound.into_iter().flatten().next().unwrap_or(Value::None);
        Err(NativeError::new(format!("fail: {}", msg)))
    }));

    add("get", Value::builtin("get", |_, args, kwargs| {
        let mut bound = bind_args("get", &["container", "key", "default?"], args, kwargs)?.into_iter();
        let container = bound.next().flatten().unwrap_or(Value::None);
        let key = bound.next().flatten().unwrap_or(Value::None);
        let default = bound.next().flatten();
        let found = match (&container, &key) {
            (Value::Dict(map), Value::String(k)) => map.get(k).cloned(),
            (Value::List(items), Value::Int(i)) => {
                let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                usize::try_from(idx).ok().and_then(|idx| items.get(idx).cloned())
            }
            (_, Value::String(k)) => container.attr(k),
            _ => None,
        };
        match (found, default) {
            (Some(value), _) => Ok(value),
            (None, Some(default)) => Ok(default),
            (None, None) => Err(NativeError::new(format!(
                "get: key {} not found in {}",
                key.repr(),
                container.type_name()
            ))),
        }
    }));

    add("range", Value::builtin("range", |_, args, kwargs| {
        let mut bound = bind_args("range", &["start_or_stop", "stop?"], args, kwargs)?.into_iter();
        let first = expect_int("range", bound.next().flatten())?;
        let (start, stop) = match bound.next().flatten() {
            Some(stop) => (first, expect_int("range", Some(stop))?),
            None => (0, first),
        };
        Ok(Value::List((start..stop.max(start)).map(Value::Int).collect()))
    }));

    add("struct", Value::builtin("struct", |_, args, kwargs| {
        if !args.is_empty() {
            return Err(NativeError::new("struct: unexpected positional arguments"));
        }
        Ok(Value::new_struct("struct", kwargs.into_iter().collect()))
    }));

    add("+", Value::builtin("+", |_, args, kwargs| {
        no_kwargs("+", &kwargs)?;
        let mut iter = args.into_iter();
        let mut acc = iter.next().unwrap_or(Value::Int(0));
        for value in iter {
            acc = add_values(acc, value)?;
        }
        Ok(acc)
    }));

    add("-", Value::builtin("-", |_, args, kwargs| {
        no_kwargs("-", &kwargs)?;
        match args.as_slice() {
            [Value::Int(a)] => a.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
            [Value::Float(a)] => Ok(Value::Float(-a)),
            [Value::Int(a), Value::Int(b)] => a.checked_sub(*b).map(Value::Int).ok_or_else(|| overflow("-")),
            [a, b] => Ok(Value::Float(as_float("-", a)? - as_float("-", b)?)),
            _ => Err(NativeError::new("-: expects one or two numbers")),
        }
    }));

    add("*", Value::builtin("*", |_, args, kwargs| {
        no_kwargs("*", &kwargs)?;
        match args.as_slice() {
            [Value::Int(a), Value::Int(b)] => a.checked_mul(*b).map(Value::Int).ok_or_else(|| overflow("*")),
            [Value::String(s), Value::Int(n)] | [Value::Int(n), Value::String(s)] => {
                let count = usize::try_from(*n).unwrap_or(0);
                match s.len().checked_mul(count) {
                    Some(len) if len <= MAX_REPEAT_LEN => Ok(Value::String(s.repeat(count))),
                    _ => Err(NativeError::new(format!(
                        "*: repeated string exceeds {} bytes",
                        MAX_REPEAT_LEN
                    ))),
                }
            }
            [a, b] => Ok(Value::Float(as_float("*", a)? * as_float("*", b)?)),
            _ => Err(NativeError::new("*: expects two operands")),
        }
    }));

    add("=", Value::builtin("=", |_, args, kwargs| {
        let [a, b] = pair("=", args, kwargs)?;
        Ok(Value::Bool(a == b))
    }));
    add("!=", Value::builtin("!=", |_, args, kwargs| {
        let [a, b] = pair("!=", args, kwargs)?;
        Ok(Value::Bool(a != b))
    }));
    let comparisons: [(&str, fn(Ordering) -> bool); 4] = [
        ("<", Ordering::is_lt),
        (">", Ordering::is_gt),
        ("<=", Ordering::is_le),
        (">=", Ordering::is_ge),
    ];
    for (name, accept) in comparisons {
        let fn_name = name.to_string();
        add(name, Value::builtin(name, move |_, args, kwargs| {
            let [a, b] = pair(&fn_name, args, kwargs)?;
            Ok(Value::Bool(accept(compare(&fn_name, &a, &b)?)))
        }));
    }

    ns
}

fn no_kwargs(fn_name: &str, kwargs: &Kwargs) -> Result<(), NativeError> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(NativeError::new(format!("{}: unexpected keyword arguments", fn_name)))
    }
}

fn single(fn_name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<[Value; 1], NativeError> {
    no_kwargs(fn_name, &kwargs)?;
    <[Value; 1]>::try_from(args)
        .map_err(|args| NativeError::new(format!("{}: got {} arguments, want 1", fn_name, args.len())))
}

fn pair(fn_name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<[Value; 2], NativeError> {
    no_kwargs(fn_name, &kwargs)?;
    <[Value; 2]>::try_from(args)
        .map_err(|args| NativeError::new(format!("{}: got {} arguments, want 2", fn_name, args.len())))
}

fn expect_int(fn_name: &str, value: Option<Value>) -> Result<i64, NativeError> {
    match value {
        Some(Value::Int(i)) => Ok(i),
        Some(other) => Err(NativeError::new(format!("{}: got {}, want int", fn_name, other.type_name()))),
        None => Err(NativeError::new(format!("{}: missing int argument", fn_name))),
    }
}

fn overflow(fn_name: &str) -> NativeError {
    NativeError::new(format!("{}: integer overflow", fn_name))
}

fn as_float(fn_name: &str, value: &Value) -> Result<f64, NativeError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(NativeError::new(format!("{}: unsupported operand {}", fn_name, other.type_name()))),
    }
}

fn add_values(a: Value, b: Value) -> Result<Value, NativeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.checked_add(y).map(Value::Int).ok_or_else(|| overflow("+")),
        (Value::String(x), Value::String(y)) => Ok(Value::String(x + &y)),
        (Value::List(mut x), Value::List(y)) => {
            x.extend(y);
            Ok(Value::List(x))
        }
        (a, b) => Ok(Value::Float(as_float("+", &a)? + as_float("+", &b)?)),
    }
}

fn compare(fn_name: &str, a: &Value, b: &Value) -> Result<Ordering, NativeError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        _ => as_float(fn_name, a)?
            .partial_cmp(&as_float(fn_name, b)?)
            .ok_or_else(|| NativeError::new(format!("{}: values are not comparable", fn_name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::runtime::{Thread, call};

    fn invoke(name: &str, args: Vec<Value>) -> Result<Value, String> {
        let ns = universe();
        let mut thread = Thread::new("test");
        call(&mut thread, &ns[name], args, Vec::new()).map_err(|e| e.to_string())
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(invoke("+", vec![Value::Int(1), Value::Int(2)]), Ok(Value::Int(3)));
        assert_eq!(
            invoke("+", vec![Value::String("a".into()), Value::String("b".into())]),
            Ok(Value::String("ab".into()))
        );
        assert_eq!(invoke("-", vec![Value::Int(4)]), Ok(Value::Int(-4)));
        assert_eq!(invoke("<", vec![Value::Int(1), Value::Float(1.5)]), Ok(Value::Bool(true)));
        assert_eq!(invoke("=", vec![Value::Int(2), Value::Int(2)]), Ok(Value::Bool(true)));
    }

    #[test]
    fn integer_overflow_is_reported() {
        let max = Value::Int(i64::MAX);
        let err = invoke("+", vec![max.clone(), Value::Int(1)]).unwrap_err();
        assert!(err.starts_with("+: integer overflow"));
        let err = invoke("*", vec![max, Value::Int(2)]).unwrap_err();
        assert!(err.starts_with("*: integer overflow"));
        let err = invoke("-", vec![Value::Int(i64::MIN), Value::Int(1)]).unwrap_err();
        assert!(err.starts_with("-: integer overflow"));
        let err = invoke("-", vec![Value::Int(i64::MIN)]).unwrap_err();
        assert!(err.starts_with("-: integer overflow"));
    }

    #[test]
    fn string_repetition_is_bounded() {
        assert_eq!(
            invoke("*", vec![Value::String("ab".into()), Value::Int(3)]),
            Ok(Value::String("ababab".into()))
        );
        assert_eq!(
            invoke("*", vec![Value::Int(-2), Value::String("ab".into())]),
            Ok(Value::String(String::new()))
        );
        let err = invoke("*", vec![Value::String("x".into()), Value::Int(i64::MAX)]).unwrap_err();
        assert!(err.starts_with("*: repeated string exceeds"));
    }

    #[test]
    fn get_reads_dicts_lists_and_defaults() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        let dict = Value::Dict(map);
        assert_eq!(invoke("get", vec![dict.clone(), Value::String("a".into())]), Ok(Value::Int(1)));
        assert_eq!(
            invoke("get", vec![dict, Value::String("b".into()), Value::None]),
            Ok(Value::None)
        );
        let list = Value::List(vec![Value::Int(7), Value::Int(8)]);
        assert_eq!(invoke("get", vec![list, Value::Int(-1)]), Ok(Value::Int(8)));
    }

    #[test]
    fn fail_reports_message() {
        let err = invoke("fail", vec![Value::String("bad input".into())]).unwrap_err();
        assert!(err.starts_with("fail: bad input"));
    }
}
