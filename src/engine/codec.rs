//! Conversion between script values and JSON

use serde_json::{Map, Number};

use super::error::{InterpretationError, InterpretationResult};
use crate::script::Value;

/// Serialize a script value. Callables, objects and modules are rejected.
pub fn to_json(value: &Value) -> InterpretationResult<serde_json::Value> {
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| InterpretationError::new(format!("Cannot serialize non-finite float {}", f)))?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<InterpretationResult<_>>()?)
        }
        Value::Dict(map) => serde_json::Value::Object(object(map.iter())?),
        Value::Struct(s) => serde_json::Value::Object(object(s.fields.iter())?),
        other => {
            return Err(InterpretationError::new(format!(
                "Cannot serialize value of type '{}' to JSON",
                other.type_name()
            )));
        }
    })
}

fn object<'a>(
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> InterpretationResult<Map<String, serde_json::Value>> {
    entries
        .map(|(k, v)| Ok((k.clone(), to_json(v)?)))
        .collect()
}

/// Build a script value from JSON. Objects become dicts.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Dict(map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect())
        }
    }
}

/// Parse the JSON parameter payload. An empty payload is `{}`.
pub fn deserialize_args(serialized: &str) -> InterpretationResult<Value> {
    let trimmed = serialized.trim();
    if trimmed.is_empty() {
        return Ok(Value::Dict(Default::default()));
    }
    let json: serde_json::Value = serde_json::from_str(trimmed).map_err(|err| {
        InterpretationError::new(format!(
            "Attempted to parse the input parameters '{}' as JSON but failed: {}",
            serialized, err
        ))
    })?;
    Ok(from_json(&json))
}

/// Serialize the entry function's result for the caller.
pub fn serialize_output(value: &Value) -> InterpretationResult<String> {
    let json = to_json(value)?;
    serde_json::to_string(&json)
        .map_err(|err| InterpretationError::new(format!("Failed to serialize output object: {}", err)))
}
