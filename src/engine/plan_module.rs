//! The `plan` handle passed to entry functions
//!
//! Every method builds an [`Instruction`], consults the mask at the current
//! plan position and appends the scheduled result to the shared plan. The
//! value handed back to the script is either freshly derived or, when the
//! instruction resolved Equal against history, the historical one.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use super::bindings::{InterpretationContext, absolute_locator};
use super::codec;
use super::instruction::{Instruction, ResolutionStatus};
use super::plan::{InstructionUuid, ScheduledInstruction};
use super::types::{EXEC_RECIPE_TYPE_NAME, SERVICE_CONFIG_TYPE_NAME, string_list};
use crate::script::{Kwargs, NativeError, NativeObject, Thread, Value, bind_args, expect_string};

/// Type name of the plan handle.
pub const PLAN_MODULE_NAME: &str = "plan";

const SERVICE_TYPE_NAME: &str = "Service";
const EXEC_RESULT_TYPE_NAME: &str = "ExecResult";

type Method = fn(&InterpretationContext, &Thread, Vec<Value>, Kwargs) -> Result<Value, NativeError>;

const METHODS: [(&str, Method); 5] = [
    ("add_service", add_service),
    ("remove_service", remove_service),
    ("exec", exec),
    ("upload_files", upload_files),
    ("print", print),
];

/// Script-visible plan handle.
pub(crate) struct PlanModule {
    ctx: Weak<InterpretationContext>,
}

impl PlanModule {
    pub(crate) fn new(ctx: &Rc<InterpretationContext>) -> Self {
        Self {
            ctx: Rc::downgrade(ctx),
        }
    }
}

impl NativeObject for PlanModule {
    fn type_name(&self) -> &str {
        PLAN_MODULE_NAME
    }

    fn attr(&self, name: &str) -> Option<Value> {
        let (method_name, method) = METHODS.iter().copied().find(|(n, _)| *n == name)?;
        let ctx = self.ctx.clone();
        Some(Value::builtin(method_name, move |thread, args, kwargs| {
            let ctx = ctx
                .upgrade()
                .ok_or_else(|| NativeError::new("plan used after its interpretation finished"))?;
            method(&ctx, thread, args, kwargs)
        }))
    }
}

/// Append `instruction` at the current position, resolving it against the
/// mask override for that slot. `fresh` derives the script-visible value for
/// an instruction that does not reuse history.
fn schedule(
    ctx: &InterpretationContext,
    instruction: Instruction,
    fresh: impl FnOnce(&InstructionUuid) -> Value,
    from_history: impl FnOnce(&serde_json::Value) -> Value,
) -> Result<Value, NativeError> {
    let mut plan = ctx.plan.borrow_mut();
    let mut components = ctx.components.borrow_mut();
    let slot = plan.size();

    let status = match ctx.mask.get(slot) {
        Some(historical) => {
            let status = instruction.try_resolve_with(historical.instruction(), &mut components);
            if status == ResolutionStatus::Equal && !plan.contains(historical.uuid()) {
                let scheduled = ScheduledInstruction::new(
                    historical.uuid().clone(),
                    instruction,
                    historical.returned_value().clone(),
                    ctx.options,
                )
                .executed(true);
                plan.add_scheduled_instruction(scheduled);
                return Ok(from_history(historical.returned_value()));
            }
            Some(status)
        }
        None => None,
    };

    match status {
        Some(ResolutionStatus::Different) => {
            tracing::debug!(slot, instruction = %instruction, "Instruction differs from the mask override");
            ctx.mask.mark_invalid();
            instruction.record_as_new(&mut components);
        }
        Some(_) => {}
        None => instruction.record_as_new(&mut components),
    }

    let uuid = plan.next_uuid(&instruction);
    let value = fresh(&uuid);
    let returned = codec::to_json(&value).map_err(|err| NativeError::new(err.to_string()))?;
    plan.add_scheduled_instruction(ScheduledInstruction::new(uuid, instruction, returned, ctx.options));
    Ok(value)
}

/// Rebuild a typed struct from its JSON form.
fn struct_from_json(type_name: &str, json: &serde_json::Value) -> Value {
    match codec::from_json(json) {
        Value::Dict(fields) => Value::new_struct(type_name, fields),
        other => other,
    }
}

fn single_string(fn_name: &str, param: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<String, NativeError> {
    let value = bind_args(fn_name, &[param], args, kwargs)?
        .into_iter()
        .flatten()
        .next()
        .unwrap_or(Value::None);
    expect_string(fn_name, param, value)
}

fn expect_struct<'a>(fn_name: &str, param: &str, type_name: &str, value: &'a Value) -> Result<&'a Value, NativeError> {
    match value {
        Value::Struct(s) if s.type_name == type_name => Ok(value),
        other => Err(NativeError::new(format!(
            "{}: for parameter {}: got {}, want {}",
            fn_name,
            param,
            other.type_name(),
            type_name
        ))),
    }
}

fn add_service(ctx: &InterpretationContext, _: &Thread, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let fn_name = "add_service";
    let mut bound = bind_args(fn_name, &["name", "config"], args, kwargs)?.into_iter();
    let name = expect_string(fn_name, "name", bound.next().flatten().unwrap_or(Value::None))?;
    let config = bound.next().flatten().unwrap_or(Value::None);
    let config = expect_struct(fn_name, "config", SERVICE_CONFIG_TYPE_NAME, &config)?;
    let config_json = codec::to_json(config).map_err(|err| NativeError::new(err.to_string()))?;

    let ports = config.attr("ports").unwrap_or(Value::Dict(BTreeMap::new()));
    let service_name = name.clone();
    schedule(
        ctx,
        Instruction::AddService {
            name,
            config: config_json,
        },
        move |_| {
            let mut fields = BTreeMap::new();
            fields.insert("hostname".to_string(), Value::String(service_name.clone()));
            fields.insert("name".to_string(), Value::String(service_name));
            fields.insert("ports".to_string(), ports);
            Value::new_struct(SERVICE_TYPE_NAME, fields)
        },
        |json| struct_from_json(SERVICE_TYPE_NAME, json),
    )
}

fn remove_service(ctx: &InterpretationContext, _: &Thread, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let name = single_string("remove_service", "name", args, kwargs)?;
    let returned = name.clone();
    schedule(
        ctx,
        Instruction::RemoveService { name },
        move |_| Value::String(returned),
        codec::from_json,
    )
}

fn exec(ctx: &InterpretationContext, _: &Thread, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let fn_name = "exec";
    let mut bound = bind_args(fn_name, &["service_name", "recipe"], args, kwargs)?.into_iter();
    let service_name = expect_string(fn_name, "service_name", bound.next().flatten().unwrap_or(Value::None))?;
    let recipe = bound.next().flatten().unwrap_or(Value::None);
    let recipe = expect_struct(fn_name, "recipe", EXEC_RECIPE_TYPE_NAME, &recipe)?;
    let command = string_list(fn_name, "recipe.command", &recipe.attr("command").unwrap_or(Value::None))?;

    schedule(
        ctx,
        Instruction::Exec {
            service_name,
            command,
        },
        |uuid| {
            // resolved when the instruction actually runs
            let mut fields = BTreeMap::new();
            fields.insert("code".to_string(), Value::String(format!("{{{{exec.{}.code}}}}", uuid)));
            fields.insert("output".to_string(), Value::String(format!("{{{{exec.{}.output}}}}", uuid)));
            Value::new_struct(EXEC_RESULT_TYPE_NAME, fields)
        },
        |json| struct_from_json(EXEC_RESULT_TYPE_NAME, json),
    )
}

fn upload_files(ctx: &InterpretationContext, thread: &Thread, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let fn_name = "upload_files";
    let mut bound = bind_args(fn_name, &["src", "name?"], args, kwargs)?.into_iter();
    let src = expect_string(fn_name, "src", bound.next().flatten().unwrap_or(Value::None))?;
    let name = match bound.next().flatten() {
        Some(value) => expect_string(fn_name, "name", value)?,
        None => artifact_name_for(&src),
    };

    let src = absolute_locator(ctx, thread, &src)?;
    ctx.provider
        .get_module_contents(&src)
        .map_err(|err| NativeError::new(format!("{}: {}", fn_name, err)))?;

    let artifact = name.clone();
    schedule(
        ctx,
        Instruction::UploadFiles { src, name },
        move |_| Value::String(artifact),
        codec::from_json,
    )
}

fn artifact_name_for(src: &str) -> String {
    src.trim_start_matches("./")
        .trim_start_matches("../")
        .replace(['/', '.'], "-")
}

fn print(ctx: &InterpretationContext, _: &Thread, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, NativeError> {
    let message = bind_args("print", &["msg"], args, kwargs)?
        .into_iter()
        .flatten()
        .next()
        .unwrap_or(Value::None)
        .to_string();
    schedule(ctx, Instruction::Print { message }, |_| Value::None, |_| Value::None)
}
