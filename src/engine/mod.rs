//! Plan engine: interpretation of enclave scripts and reconciliation of the
//! resulting plans against enclave history.
//!
//! An [`Interpreter`] owns an exclusive lease; every interpretation, including
//! every pass of [`Interpreter::interpret_and_optimize_plan`], runs while
//! holding it.

/// Namespace assembly and module loading.
pub mod bindings;
/// Script value ⇄ JSON conversion.
pub mod codec;
/// Interpreter configuration.
pub mod config;
/// Error types and failure translation.
pub mod error;
/// Persisted enclave history.
pub mod history;
/// Instruction kinds and resolution.
pub mod instruction;
/// Positional overrides.
pub mod mask;
mod optimizer;
/// Package content providers.
pub mod packages;
/// Instruction plan.
pub mod plan;
mod plan_module;
/// Atomic JSON storage.
pub mod storage;
/// Domain type constructors.
pub mod types;

use parking_lot::Mutex;
use std::rc::Rc;
use tracing::{debug, warn};

pub use bindings::{BuiltinsProcessor, SharedPackageContentProvider};
pub use config::InterpreterConfig;
pub use error::{InterpretationError, InterpretationResult};
pub use history::{EnclavePlan, EnclavePlanInstruction};
pub use instruction::{EnclaveComponents, ImageDownloadMode, Instruction, InstructionOptions, ResolutionStatus};
pub use mask::InstructionsPlanMask;
pub use packages::{
    InMemoryPackageContentProvider, LocalPackageContentProvider, PackageContentProvider,
    PackageReplaceOptions,
};
pub use plan::{InstructionUuid, InstructionsPlan, ScheduledInstruction};

use bindings::{InterpretationContext, interpret_module};
use error::translate;
use plan_module::PlanModule;
use crate::script::{self, Value};

/// Entry function used when none (or `run`) is requested.
pub const DEFAULT_MAIN_FUNCTION_NAME: &str = "run";

/// Serialized output of an entry function that returned `None`.
pub const NO_OUTPUT_OBJECT: &str = "";

/// Package id used for scripts submitted without a package.
pub const DEFAULT_PACKAGE_ID_FOR_SCRIPT: &str = "DEFAULT_PACKAGE_ID_FOR_SCRIPT";

const PLAN_PARAM_INDEX: usize = 0;
const PLAN_PARAM_NAME: &str = "plan";
const ARGS_PARAM_INDEX: usize = 1;
const ARGS_PARAM_NAME: &str = "args";
const PARAMS_REQUIRED_FOR_ARGS: usize = 2;

/// Everything needed to interpret one script.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretRequest {
    /// Package the script belongs to, or [`DEFAULT_PACKAGE_ID_FOR_SCRIPT`].
    pub package_id: String,
    /// Package prefix replacements.
    pub package_replace_options: PackageReplaceOptions,
    /// Entry function; empty selects [`DEFAULT_MAIN_FUNCTION_NAME`].
    pub main_function_name: String,
    /// Path of the main file inside the package.
    pub relative_path_to_main_file: String,
    /// Script text of the main file.
    pub serialized_script: String,
    /// JSON parameters; empty means `{}`.
    pub serialized_params: String,
    /// Do not wait for readiness checks.
    pub non_blocking: bool,
    /// Image pull policy.
    pub image_download_mode: ImageDownloadMode,
}

impl InterpretRequest {
    /// Request for a standalone script.
    pub fn script(serialized_script: impl Into<String>) -> Self {
        Self::package(DEFAULT_PACKAGE_ID_FOR_SCRIPT, "", serialized_script)
    }

    /// Request for the main file of a package.
    pub fn package(
        package_id: impl Into<String>,
        relative_path_to_main_file: impl Into<String>,
        serialized_script: impl Into<String>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            package_replace_options: PackageReplaceOptions::new(),
            main_function_name: String::new(),
            relative_path_to_main_file: relative_path_to_main_file.into(),
            serialized_script: serialized_script.into(),
            serialized_params: String::new(),
            non_blocking: false,
            image_download_mode: ImageDownloadMode::default(),
        }
    }

    /// Set the entry function.
    pub fn with_main_function(mut self, name: impl Into<String>) -> Self {
        self.main_function_name = name.into();
        self
    }

    /// Set the JSON parameters.
    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.serialized_params = params.into();
        self
    }

    /// Set package replacements.
    pub fn with_replace_options(mut self, options: PackageReplaceOptions) -> Self {
        self.package_replace_options = options;
        self
    }

    /// Set the non-blocking flag.
    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Set the image pull policy.
    pub fn with_image_download_mode(mut self, mode: ImageDownloadMode) -> Self {
        self.image_download_mode = mode;
        self
    }

    fn module_locator(&self) -> String {
        if self.package_id == DEFAULT_PACKAGE_ID_FOR_SCRIPT {
            return self.package_id.clone();
        }
        let relative = self
            .relative_path_to_main_file
            .trim_start_matches("./")
            .trim_start_matches('/');
        if relative.is_empty() {
            self.package_id.clone()
        } else {
            format!("{}/{}", self.package_id.trim_end_matches('/'), relative)
        }
    }

    fn instruction_options(&self) -> InstructionOptions {
        InstructionOptions {
            non_blocking: self.non_blocking,
            image_download_mode: self.image_download_mode,
        }
    }
}

/// Result of a successful interpretation.
#[derive(Debug, Clone)]
pub struct Interpretation {
    /// JSON output of the entry function, or [`NO_OUTPUT_OBJECT`].
    pub serialized_output: String,
    /// Instructions issued through the plan handle.
    pub plan: InstructionsPlan,
}

/// Script interpreter bound to one enclave.
pub struct Interpreter {
    lease: Mutex<()>,
    provider: SharedPackageContentProvider,
    config: InterpreterConfig,
    builtins_processor: Option<BuiltinsProcessor>,
}

impl Interpreter {
    /// Create an interpreter reading modules from `provider`.
    pub fn new(provider: SharedPackageContentProvider, config: InterpreterConfig) -> Self {
        Self {
            lease: Mutex::new(()),
            provider,
            config,
            builtins_processor: None,
        }
    }

    /// Install a hook that adjusts the predeclared names of every module.
    pub fn with_builtins_processor(mut self, processor: BuiltinsProcessor) -> Self {
        self.builtins_processor = Some(processor);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Interpret a script once.
    ///
    /// Instructions are resolved against `mask` as they are issued; what the
    /// pass learns about services and artifacts accumulates in `components`.
    pub fn interpret(
        &self,
        request: &InterpretRequest,
        components: &mut EnclaveComponents,
        mask: &InstructionsPlanMask,
    ) -> InterpretationResult<Interpretation> {
        let _lease = self.lease.lock();
        self.interpret_locked(request, components, mask)
    }

    /// Like [`Interpreter::interpret`], but instructions are appended to a
    /// caller-owned `plan`. Everything issued before a failure stays in it.
    pub fn interpret_into(
        &self,
        request: &InterpretRequest,
        components: &mut EnclaveComponents,
        mask: &InstructionsPlanMask,
        plan: &mut InstructionsPlan,
    ) -> InterpretationResult<String> {
        let _lease = self.lease.lock();
        self.run_locked(request, components, mask, plan)
    }

    pub(crate) fn interpret_locked(
        &self,
        request: &InterpretRequest,
        components: &mut EnclaveComponents,
        mask: &InstructionsPlanMask,
    ) -> InterpretationResult<Interpretation> {
        let mut plan = InstructionsPlan::new();
        let serialized_output = self.run_locked(request, components, mask, &mut plan)?;
        debug!(instructions = plan.size(), "Successfully interpreted script");
        Ok(Interpretation {
            serialized_output,
            plan,
        })
    }

    fn run_locked(
        &self,
        request: &InterpretRequest,
        components: &mut EnclaveComponents,
        mask: &InstructionsPlanMask,
        plan: &mut InstructionsPlan,
    ) -> InterpretationResult<String> {
        debug!(
            package_id = %request.package_id,
            params = %request.serialized_params,
            mask_size = mask.size(),
            "Interpreting package"
        );
        let locator = request.module_locator();
        // module contents may change between calls, so the cache lives in
        // this context only
        let ctx = Rc::new(InterpretationContext::new(
            request.package_id.clone(),
            request.package_replace_options.clone(),
            self.provider.clone(),
            self.config.clone(),
            self.builtins_processor.clone(),
            request.instruction_options(),
            std::mem::take(components),
            std::mem::take(plan),
            mask.clone(),
        ));

        let output = run_main_function(&ctx, request, &locator);
        *components = ctx.components.take();
        *plan = ctx.plan.take();
        output
    }
}

fn run_main_function(
    ctx: &Rc<InterpretationContext>,
    request: &InterpretRequest,
    locator: &str,
) -> InterpretationResult<String> {
    let globals = interpret_module(ctx, locator, &request.serialized_script)?;

    let (main_function_name, is_default) = match request.main_function_name.as_str() {
        "" | DEFAULT_MAIN_FUNCTION_NAME => (DEFAULT_MAIN_FUNCTION_NAME, true),
        other => (other, false),
    };
    let main_value = globals
        .get(main_function_name)
        .ok_or_else(|| missing_main_function_error(&request.package_id, main_function_name))?;
    let Value::Function(main_function) = &main_value else {
        return Err(missing_main_function_error(&request.package_id, main_function_name));
    };

    let mut args = Vec::new();
    if let Some(first_param) = main_function.param(PLAN_PARAM_INDEX) {
        if first_param == PLAN_PARAM_NAME {
            args.push(Value::Object(Rc::new(PlanModule::new(ctx))));
        } else if is_default {
            return Err(InterpretationError::new(format!(
                "Expected argument at index '{}' of run function to be called '{}' got '{}'",
                PLAN_PARAM_INDEX, PLAN_PARAM_NAME, first_param
            )));
        }
    }

    let input_args = codec::deserialize_args(&request.serialized_params)?;
    let mut kwargs = Vec::new();
    let legacy_args = is_default
        && main_function.num_params() == PARAMS_REQUIRED_FOR_ARGS
        && main_function.param(ARGS_PARAM_INDEX) == Some(ARGS_PARAM_NAME);
    if legacy_args {
        warn!(
            "Using args dictionary as parameter is deprecated. Consider unpacking the dictionary into individual parameters. For example: run(plan, args) to run(plan, param1, param2, ...)"
        );
        args.push(input_args);
    } else {
        match input_args {
            Value::Dict(entries) => kwargs.extend(entries),
            other => {
                return Err(InterpretationError::new(format!(
                    "An error occurred casting input args '{}' to a dictionary",
                    other
                )));
            }
        }
    }

    let mut thread = ctx.new_thread(locator);
    let output = script::call(&mut thread, &main_value, args, kwargs).map_err(translate)?;
    if output == Value::None {
        return Ok(NO_OUTPUT_OBJECT.to_string());
    }
    debug!(output = %output, "Entry function returned a value");
    codec::serialize_output(&output)
}

fn missing_main_function_error(package_id: &str, name: &str) -> InterpretationError {
    if package_id == DEFAULT_PACKAGE_ID_FOR_SCRIPT {
        InterpretationError::new(format!(
            "No '{name}' function found in the script; a '{name}' entrypoint function with the signature `{name}(plan, args)` or `{name}()` is required in the script"
        ))
    } else {
        InterpretationError::new(format!(
            "No '{name}' function found in the main file of package '{package_id}'; a '{name}' entrypoint function with the signature `{name}(plan, args)` or `{name}()` is required in the main file of the package"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn interpreter() -> Interpreter {
        Interpreter::new(Arc::new(InMemoryPackageContentProvider::new()), InterpreterConfig::default())
    }

    #[test]
    fn module_locator_joins_package_and_main_file() {
        let request = InterpretRequest::package("github.com/org/pkg", "main.star", "");
        assert_eq!(request.module_locator(), "github.com/org/pkg/main.star");
        assert_eq!(InterpretRequest::script("").module_locator(), DEFAULT_PACKAGE_ID_FOR_SCRIPT);
    }

    #[test]
    fn output_is_serialized() {
        let request = InterpretRequest::script("(def run (plan) (dict :ok True))");
        let result = interpreter()
            .interpret(&request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default())
            .unwrap();
        assert_eq!(result.serialized_output, r#"{"ok":true}"#);
    }

    #[test]
    fn none_output_is_the_sentinel() {
        let request = InterpretRequest::script("(def run () None)");
        let result = interpreter()
            .interpret(&request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default())
            .unwrap();
        assert_eq!(result.serialized_output, NO_OUTPUT_OBJECT);
        assert_eq!(result.plan.size(), 0);
    }

    #[test]
    fn components_are_handed_back() {
        let request = InterpretRequest::script(
            "(def run (plan) (plan.add_service \"db\" (ServiceConfig \"postgres\")))",
        );
        let mut components = EnclaveComponents::new();
        interpreter()
            .interpret(&request, &mut components, &InstructionsPlanMask::default())
            .unwrap();
        assert!(components.is_service_updated("db"));
    }

    #[test]
    fn non_mapping_params_are_rejected() {
        let request = InterpretRequest::script("(def run (plan a) a)").with_params("[1, 2]");
        let err = interpreter()
            .interpret(&request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default())
            .unwrap_err();
        assert!(err.to_string().contains("to a dictionary"));
    }
}
