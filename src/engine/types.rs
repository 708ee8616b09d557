//! Domain type constructors predeclared in every module

use std::collections::BTreeMap;

use crate::script::{Kwargs, NativeError, Namespace, Value, bind_args, expect_string};

/// `ServiceConfig` type name.
pub const SERVICE_CONFIG_TYPE_NAME: &str = "ServiceConfig";
/// `PortSpec` type name.
pub const PORT_SPEC_TYPE_NAME: &str = "PortSpec";
/// `ExecRecipe` type name.
pub const EXEC_RECIPE_TYPE_NAME: &str = "ExecRecipe";

const DEFAULT_TRANSPORT_PROTOCOL: &str = "TCP";

/// All type constructors, by name.
pub fn type_constructors() -> Namespace {
    let mut ns = Namespace::new();
    ns.insert(
        SERVICE_CONFIG_TYPE_NAME.into(),
        Value::builtin(SERVICE_CONFIG_TYPE_NAME, |_, args, kwargs| service_config(args, kwargs)),
    );
    ns.insert(
        PORT_SPEC_TYPE_NAME.into(),
        Value::builtin(PORT_SPEC_TYPE_NAME, |_, args, kwargs| port_spec(args, kwargs)),
    );
    ns.insert(
        EXEC_RECIPE_TYPE_NAME.into(),
        Value::builtin(EXEC_RECIPE_TYPE_NAME, |_, args, kwargs| exec_recipe(args, kwargs)),
    );
    ns
}

fn service_config(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let name = SERVICE_CONFIG_TYPE_NAME;
    let mut bound = bind_args(name, &["image", "ports?", "env_vars?", "cmd?", "files?"], args, kwargs)?.into_iter();
    let image = expect_string(name, "image", bound.next().flatten().unwrap_or(Value::None))?;

    let mut fields = BTreeMap::new();
    fields.insert("image".to_string(), Value::String(image));

    let ports = bound.next().flatten().unwrap_or(Value::Dict(BTreeMap::new()));
    match &ports {
        Value::Dict(entries) => {
            for (port_name, spec) in entries {
                if !matches!(spec, Value::Struct(s) if s.type_name == PORT_SPEC_TYPE_NAME) {
                    return Err(NativeError::new(format!(
                        "{}: port '{}' must be a {}, got {}",
                        name,
                        port_name,
                        PORT_SPEC_TYPE_NAME,
                        spec.type_name()
                    )));
                }
            }
        }
        other => return Err(wrong_type(name, "ports", "dict", other)),
    }
    fields.insert("ports".to_string(), ports);

    let env_vars = bound.next().flatten().unwrap_or(Value::Dict(BTreeMap::new()));
    match &env_vars {
        Value::Dict(entries) => {
            if let Some((key, _)) = entries.iter().find(|(_, v)| v.as_str().is_none()) {
                return Err(NativeError::new(format!(
                    "{}: env var '{}' must be a string",
                    name, key
                )));
            }
        }
        other => return Err(wrong_type(name, "env_vars", "dict", other)),
    }
    fields.insert("env_vars".to_string(), env_vars);

    let cmd = bound.next().flatten().unwrap_or(Value::List(Vec::new()));
    string_list(name, "cmd", &cmd)?;
    fields.insert("cmd".to_string(), cmd);

    // mount path -> files artifact name
    let files = bound.next().flatten().unwrap_or(Value::Dict(BTreeMap::new()));
    match &files {
        Value::Dict(entries) => {
            if let Some((path, _)) = entries.iter().find(|(_, v)| v.as_str().is_none()) {
                return Err(NativeError::new(format!(
                    "{}: files mount '{}' must name an artifact",
                    name, path
                )));
            }
        }
        other => return Err(wrong_type(name, "files", "dict", other)),
    }
    fields.insert("files".to_string(), files);

    Ok(Value::new_struct(name, fields))
}

fn port_spec(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let name = PORT_SPEC_TYPE_NAME;
    let mut bound = bind_args(
        name,
        &["number", "transport_protocol?", "application_protocol?"],
        args,
        kwargs,
    )?
    .into_iter();
    let number = match bound.next().flatten() {
        Some(Value::Int(n)) if (1..=65535).contains(&n) => n,
        Some(Value::Int(n)) => {
            return Err(NativeError::new(format!(
                "{}: port number {} is outside 1-65535",
                name, n
            )));
        }
        other => return Err(wrong_type(name, "number", "int", &other.unwrap_or(Value::None))),
    };
    let transport = match bound.next().flatten() {
        Some(value) => expect_string(name, "transport_protocol", value)?.to_uppercase(),
        None => DEFAULT_TRANSPORT_PROTOCOL.to_string(),
    };
    if !matches!(transport.as_str(), "TCP" | "UDP" | "SCTP") {
        return Err(NativeError::new(format!(
            "{}: unsupported transport protocol '{}'",
            name, transport
        )));
    }

    let mut fields = BTreeMap::new();
    fields.insert("number".to_string(), Value::Int(number));
    fields.insert("transport_protocol".to_string(), Value::String(transport));
    if let Some(app) = bound.next().flatten() {
        let app = expect_string(name, "application_protocol", app)?;
        fields.insert("application_protocol".to_string(), Value::String(app));
    }
    Ok(Value::new_struct(name, fields))
}

fn exec_recipe(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let name = EXEC_RECIPE_TYPE_NAME;
    let command = bind_args(name, &["command"], args, kwargs)?
        .into_iter()
        .flatten()
        .next()
        .unwrap_or(Value::None);
    string_list(name, "command", &command)?;
    if matches!(&command, Value::List(items) if items.is_empty()) {
        return Err(NativeError::new(format!("{}: command cannot be empty", name)));
    }
    let mut fields = BTreeMap::new();
    fields.insert("command".to_string(), command);
    Ok(Value::new_struct(name, fields))
}

/// Check that `value` is a list of strings and return them.
pub(crate) fn string_list(fn_name: &str, param: &str, value: &Value) -> Result<Vec<String>, NativeError> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| wrong_type(fn_name, param, "list of strings", value))
            })
            .collect(),
        other => Err(wrong_type(fn_name, param, "list of strings", other)),
    }
}

fn wrong_type(fn_name: &str, param: &str, want: &str, got: &Value) -> NativeError {
    NativeError::new(format!(
        "{}: for parameter {}: got {}, want {}",
        fn_name,
        param,
        got.type_name(),
        want
    ))
}
