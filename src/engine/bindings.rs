//! Namespace assembly and recursive module loading
//!
//! An [`InterpretationContext`] lives for one top-level interpretation. It
//! owns the module cache and the shared plan, and it is threaded explicitly
//! through every module execution: the entry module and each module it
//! imports, depth-first. Natives installed in a module namespace hold only a
//! weak reference to the context, so cached module globals never keep it
//! alive.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::config::InterpreterConfig;
use super::error::{InterpretationError, InterpretationResult, translate};
use super::instruction::{EnclaveComponents, InstructionOptions};
use super::mask::InstructionsPlanMask;
use super::packages::{PackageContentProvider, PackageReplaceOptions, get_module_prefix};
use super::plan::InstructionsPlan;
use super::types::type_constructors;
use crate::script::{
    Globals, Module, NativeError, Namespace, Thread, Value, bind_args, exec_file, expect_string,
};

/// Name of the import helper. Frames with this name are hidden from stack
/// traces.
pub const IMPORT_MODULE_BUILTIN_NAME: &str = "import_module";
/// Name of the file-reading helper.
pub const READ_FILE_BUILTIN_NAME: &str = "read_file";
/// Name of the enclave capability handle.
pub const ENCLAVE_MODULE_NAME: &str = "enclave";

/// Raised by the disabled `print` statement.
pub const PRINT_DISABLED_MSG: &str =
    "'print' statement is not available in enclave scripts. Please use `(plan.print \"message\")` instead";
/// Raised by the disabled `load` statement.
pub const LOAD_DISABLED_MSG: &str = "'(load \"path/to/file.star\" var_in_file)' statement is not available in enclave scripts. Please use instead `(let module (import_module \"path/to/file.star\"))` and then `module.var_in_file`";

/// Caller hook that may add or replace predeclared names.
pub type BuiltinsProcessor = Arc<dyn Fn(Namespace) -> Namespace + Send + Sync>;

/// Provider shared by every interpretation of one interpreter.
pub type SharedPackageContentProvider = Arc<dyn PackageContentProvider + Send + Sync>;

/// Collaborators and shared state of one top-level interpretation.
pub(crate) struct InterpretationContext {
    pub(crate) package_id: String,
    pub(crate) replace_options: PackageReplaceOptions,
    pub(crate) provider: SharedPackageContentProvider,
    pub(crate) config: InterpreterConfig,
    pub(crate) builtins_processor: Option<BuiltinsProcessor>,
    pub(crate) options: InstructionOptions,
    pub(crate) plan: RefCell<InstructionsPlan>,
    pub(crate) components: RefCell<EnclaveComponents>,
    pub(crate) mask: InstructionsPlanMask,
    module_cache: RefCell<HashMap<String, InterpretationResult<Globals>>>,
}

impl InterpretationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        package_id: String,
        replace_options: PackageReplaceOptions,
        provider: SharedPackageContentProvider,
        config: InterpreterConfig,
        builtins_processor: Option<BuiltinsProcessor>,
        options: InstructionOptions,
        components: EnclaveComponents,
        plan: InstructionsPlan,
        mask: InstructionsPlanMask,
    ) -> Self {
        Self {
            package_id,
            replace_options,
            provider,
            config,
            builtins_processor,
            options,
            plan: RefCell::new(plan),
            components: RefCell::new(components),
            mask,
            module_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Fresh execution context for one module or entry call.
    pub(crate) fn new_thread(&self, name: &str) -> Thread {
        Thread::new(name)
            .with_max_steps(self.config.max_steps)
            .with_print(Box::new(|_, _| Err(NativeError::new(PRINT_DISABLED_MSG))))
            .with_load(Box::new(|_, _| Err(NativeError::new(LOAD_DISABLED_MSG))))
    }
}

/// Execute one module under its own thread and return its globals.
pub(crate) fn interpret_module(
    ctx: &Rc<InterpretationContext>,
    locator: &str,
    source: &str,
) -> InterpretationResult<Globals> {
    let mut thread = ctx.new_thread(locator);
    let predeclared = build_bindings(ctx);
    exec_file(&mut thread, locator, source, &predeclared).map_err(translate)
}

/// Load an imported module through the shared cache.
fn load_module(ctx: &Rc<InterpretationContext>, locator: &str) -> InterpretationResult<Globals> {
    if let Some(cached) = ctx.module_cache.borrow().get(locator) {
        return cached.clone();
    }
    // stays in place while the module runs so a circular import hits it
    ctx.module_cache.borrow_mut().insert(
        locator.to_string(),
        Err(InterpretationError::new(format!(
            "There is a cycle in the {} calls involving module '{}'",
            IMPORT_MODULE_BUILTIN_NAME, locator
        ))),
    );

    let result = ctx
        .provider
        .get_module_contents(locator)
        .map_err(InterpretationError::from)
        .and_then(|source| interpret_module(ctx, locator, &source));
    ctx.module_cache
        .borrow_mut()
        .insert(locator.to_string(), result.clone());
    result
}

fn upgrade(ctx: &Weak<InterpretationContext>) -> Result<Rc<InterpretationContext>, NativeError> {
    ctx.upgrade()
        .ok_or_else(|| NativeError::new("interpretation already finished"))
}

/// Resolve a locator written in the module currently executing on `thread`.
pub(crate) fn absolute_locator(
    ctx: &InterpretationContext,
    thread: &Thread,
    locator: &str,
) -> Result<String, NativeError> {
    ctx.provider
        .get_absolute_locator(
            &ctx.package_id,
            thread.current_module(),
            locator,
            &ctx.replace_options,
        )
        .map_err(|err| NativeError::new(err.to_string()))
}

/// Namespace predeclared in every module of this interpretation.
pub(crate) fn build_bindings(ctx: &Rc<InterpretationContext>) -> Namespace {
    let mut predeclared = Namespace::new();
    predeclared.insert(ENCLAVE_MODULE_NAME.to_string(), enclave_module(&ctx.config));

    let weak = Rc::downgrade(ctx);
    predeclared.insert(
        IMPORT_MODULE_BUILTIN_NAME.to_string(),
        Value::builtin(IMPORT_MODULE_BUILTIN_NAME, move |thread, args, kwargs| {
            let ctx = upgrade(&weak)?;
            let requested = bind_args(IMPORT_MODULE_BUILTIN_NAME, &["module_file"], args, kwargs)?
                .into_iter()
                .flatten()
                .next()
                .unwrap_or(Value::None);
            let requested = expect_string(IMPORT_MODULE_BUILTIN_NAME, "module_file", requested)?;
            let locator = absolute_locator(&ctx, thread, &requested)?;

            let module_prefix = get_module_prefix(&locator);
            if module_prefix != get_module_prefix(&ctx.package_id) {
                ctx.plan.borrow_mut().add_package_dependency(module_prefix);
            }

            let globals = load_module(&ctx, &locator).map_err(|err| NativeError::new(err.to_string()))?;
            Ok(Value::Module(Rc::new(Module {
                name: locator,
                globals,
            })))
        }),
    );

    let weak = Rc::downgrade(ctx);
    predeclared.insert(
        READ_FILE_BUILTIN_NAME.to_string(),
        Value::builtin(READ_FILE_BUILTIN_NAME, move |thread, args, kwargs| {
            let ctx = upgrade(&weak)?;
            let src = bind_args(READ_FILE_BUILTIN_NAME, &["src"], args, kwargs)?
                .into_iter()
                .flatten()
                .next()
                .unwrap_or(Value::None);
            let src = expect_string(READ_FILE_BUILTIN_NAME, "src", src)?;
            let locator = absolute_locator(&ctx, thread, &src)?;
            ctx.provider
                .get_module_contents(&locator)
                .map(Value::String)
                .map_err(|err| NativeError::new(err.to_string()))
        }),
    );

    predeclared.extend(type_constructors());

    match &ctx.builtins_processor {
        Some(process) => process(predeclared),
        None => predeclared,
    }
}

fn enclave_module(config: &InterpreterConfig) -> Value {
    let env_vars: BTreeMap<String, Value> = config
        .enclave_env_vars
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut fields = BTreeMap::new();
    fields.insert("enclave_id".to_string(), Value::String(config.enclave_id.clone()));
    fields.insert("env_vars".to_string(), Value::Dict(env_vars));
    Value::new_struct(ENCLAVE_MODULE_NAME, fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::packages::InMemoryPackageContentProvider;

    const PKG: &str = "github.com/org/pkg";

    fn context(provider: InMemoryPackageContentProvider) -> Rc<InterpretationContext> {
        Rc::new(InterpretationContext::new(
            PKG.to_string(),
            PackageReplaceOptions::new(),
            Arc::new(provider),
            InterpreterConfig::default(),
            None,
            InstructionOptions::default(),
            EnclaveComponents::new(),
            InstructionsPlan::new(),
            InstructionsPlanMask::default(),
        ))
    }

    #[test]
    fn imported_modules_are_cached() {
        let provider = InMemoryPackageContentProvider::new()
            .with_module("github.com/org/pkg/lib.star", "(let value 42)");
        let ctx = context(provider);
        let main = "(let a (import_module \"./lib.star\"))\n(let b (import_module \"github.com/org/pkg/lib.star\"))";
        let globals = interpret_module(&ctx, "github.com/org/pkg/main.star", main).unwrap();
        assert_eq!(globals.get("a"), globals.get("b"));
        assert_eq!(globals.get("a").and_then(|m| m.attr("value")), Some(Value::Int(42)));
        assert_eq!(ctx.plan.borrow().package_dependencies().count(), 0);
    }

    #[test]
    fn foreign_imports_record_dependencies() {
        let provider = InMemoryPackageContentProvider::new()
            .with_module("github.com/other/dep/lib.star", "(let value 1)");
        let ctx = context(provider);
        interpret_module(
            &ctx,
            "github.com/org/pkg/main.star",
            "(let dep (import_module \"github.com/other/dep/lib.star\"))",
        )
        .unwrap();
        let deps: Vec<String> = ctx.plan.borrow().package_dependencies().map(String::from).collect();
        assert_eq!(deps, vec!["github.com/other/dep"]);
    }

    #[test]
    fn circular_imports_fail() {
        let provider = InMemoryPackageContentProvider::new()
            .with_module("github.com/org/pkg/a.star", "(let b (import_module \"./b.star\"))")
            .with_module("github.com/org/pkg/b.star", "(let a (import_module \"./a.star\"))");
        let ctx = context(provider);
        let err = interpret_module(
            &ctx,
            "github.com/org/pkg/main.star",
            "(let a (import_module \"./a.star\"))",
        )
        .unwrap_err();
        assert!(err.to_string().contains("There is a cycle in the import_module calls"));
        assert!(err.stacktrace().iter().all(|f| f.name != IMPORT_MODULE_BUILTIN_NAME));
    }

    #[test]
    fn print_and_load_are_disabled() {
        let ctx = context(InMemoryPackageContentProvider::new());
        let err = interpret_module(&ctx, "github.com/org/pkg/main.star", "(print \"hi\")").unwrap_err();
        assert_eq!(err.message(), Some(format!("Evaluation error: {}", PRINT_DISABLED_MSG).as_str()));

        let err = interpret_module(&ctx, "github.com/org/pkg/main.star", "(load \"x.star\" y)").unwrap_err();
        assert_eq!(err.message(), Some(format!("Evaluation error: {}", LOAD_DISABLED_MSG).as_str()));
    }

    #[test]
    fn read_file_resolves_relative_paths() {
        let provider = InMemoryPackageContentProvider::new()
            .with_module("github.com/org/pkg/static/config.txt", "key=value");
        let ctx = context(provider);
        let globals = interpret_module(
            &ctx,
            "github.com/org/pkg/main.star",
            "(let contents (read_file \"./static/config.txt\"))",
        )
        .unwrap();
        assert_eq!(globals.get("contents"), Some(Value::String("key=value".into())));
    }

    #[test]
    fn enclave_handle_exposes_identity() {
        let ctx = context(InMemoryPackageContentProvider::new());
        let globals = interpret_module(&ctx, "github.com/org/pkg/main.star", "(let id enclave.enclave_id)").unwrap();
        assert_eq!(globals.get("id"), Some(Value::String(ctx.config.enclave_id.clone())));
    }
}
