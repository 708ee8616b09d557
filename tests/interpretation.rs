use std::collections::BTreeMap;
use std::sync::Arc;

use enclave_plan::engine::bindings::{LOAD_DISABLED_MSG, PRINT_DISABLED_MSG};
use enclave_plan::engine::error::{MULTIPLE_INTERPRETATION_ERRORS_MSG, SKIP_IMPORT_INSTRUCTION_IN_STACKTRACE};
use enclave_plan::engine::{
    EnclaveComponents, InMemoryPackageContentProvider, Instruction, InstructionsPlan,
    InstructionsPlanMask, InterpretRequest, Interpretation, InterpretationError, Interpreter,
    InterpreterConfig, NO_OUTPUT_OBJECT, ResolutionStatus,
};
use enclave_plan::script::{Namespace, TOO_MANY_STEPS_MSG, Value};

const PKG: &str = "github.com/org/pkg";

fn interpreter_with(provider: InMemoryPackageContentProvider) -> Interpreter {
    Interpreter::new(Arc::new(provider), InterpreterConfig::default())
}

fn interpreter() -> Interpreter {
    interpreter_with(InMemoryPackageContentProvider::new())
}

fn interpret(interpreter: &Interpreter, request: &InterpretRequest) -> Result<Interpretation, InterpretationError> {
    interpreter.interpret(request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default())
}

#[test]
fn run_with_plan_appends_instructions() {
    let request = InterpretRequest::script(
        r#"
        (def run (plan)
          (plan.print "hello")
          (let db (plan.add_service "db" (ServiceConfig "postgres:16" :ports (dict :pg (PortSpec 5432)))))
          (plan.exec db.name (ExecRecipe (list "psql" "-c" "select 1")))
          db.hostname)
        "#,
    );
    let result = interpret(&interpreter(), &request).unwrap();
    assert_eq!(result.serialized_output, r#""db""#);

    let plan = result.plan.generate_plan().unwrap();
    let kinds: Vec<&str> = plan.iter().map(|s| s.instruction().kind()).collect();
    assert_eq!(kinds, vec!["print", "add_service", "exec"]);
    assert_eq!(
        plan[2].instruction(),
        &Instruction::Exec {
            service_name: "db".into(),
            command: vec!["psql".into(), "-c".into(), "select 1".into()],
        }
    );
}

#[test]
fn missing_run_function_names_the_signature() {
    let err = interpret(&interpreter(), &InterpretRequest::script("(def main (plan) None)")).unwrap_err();
    assert_eq!(
        err.message(),
        Some("No 'run' function found in the script; a 'run' entrypoint function with the signature `run(plan, args)` or `run()` is required in the script")
    );
}

#[test]
fn non_callable_run_fails_like_a_missing_one() {
    let missing = interpret(&interpreter(), &InterpretRequest::script("(let other 5)")).unwrap_err();
    let not_callable = interpret(&interpreter(), &InterpretRequest::script("(let run 5)")).unwrap_err();
    assert_eq!(missing, not_callable);
}

#[test]
fn missing_entry_in_package_names_the_package() {
    let request = InterpretRequest::package(PKG, "main.star", "(let x 1)").with_main_function("deploy");
    let err = interpret(&interpreter(), &request).unwrap_err();
    let message = err.message().unwrap();
    assert!(message.starts_with("No 'deploy' function found in the main file of package 'github.com/org/pkg'"));
    assert!(message.contains("`deploy(plan, args)` or `deploy()`"));
}

#[test]
fn default_entry_requires_plan_first() {
    let err = interpret(&interpreter(), &InterpretRequest::script("(def run (ctx) None)")).unwrap_err();
    assert_eq!(
        err.message(),
        Some("Expected argument at index '0' of run function to be called 'plan' got 'ctx'")
    );
}

#[test]
fn custom_entry_may_skip_plan() {
    let request = InterpretRequest::script("(def deploy (a) (* a 2))")
        .with_main_function("deploy")
        .with_params(r#"{"a": 3}"#);
    let result = interpret(&interpreter(), &request).unwrap();
    assert_eq!(result.serialized_output, "6");
    assert_eq!(result.plan.size(), 0);
}

#[test]
fn params_bind_as_keywords() {
    let request = InterpretRequest::script("(def run (plan a b) (list a b))").with_params(r#"{"a":1,"b":2}"#);
    let result = interpret(&interpreter(), &request).unwrap();
    assert_eq!(result.serialized_output, "[1,2]");
}

#[test]
fn legacy_args_receive_the_whole_payload() {
    let request = InterpretRequest::script("(def run (plan args) (get args \"b\"))").with_params(r#"{"a":1,"b":2}"#);
    let result = interpret(&interpreter(), &request).unwrap();
    assert_eq!(result.serialized_output, "2");
}

#[test]
fn run_without_parameters_gets_empty_payload() {
    let result = interpret(&interpreter(), &InterpretRequest::script("(def run () None)")).unwrap();
    assert_eq!(result.serialized_output, NO_OUTPUT_OBJECT);
}

#[test]
fn invalid_json_params_fail() {
    let request = InterpretRequest::script("(def run (plan) None)").with_params("{\"a\":");
    assert!(interpret(&interpreter(), &request).is_err());
}

#[test]
fn identical_interpretations_are_deterministic() {
    let request = InterpretRequest::package(
        PKG,
        "main.star",
        r#"
        (def run (plan)
          (for name (list "a" "b" "c")
            (plan.add_service name (ServiceConfig "nginx")))
          (plan.upload_files "./static/site.html" :name "site"))
        "#,
    );
    let provider = InMemoryPackageContentProvider::new().with_module("github.com/org/pkg/static/site.html", "<html/>");
    let interpreter = interpreter_with(provider);

    let first = interpret(&interpreter, &request).unwrap().plan.generate_plan().unwrap();
    let second = interpret(&interpreter, &request).unwrap().plan.generate_plan().unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        let mut components = EnclaveComponents::new();
        assert_eq!(
            a.instruction().try_resolve_with(b.instruction(), &mut components),
            ResolutionStatus::Equal
        );
        assert_eq!(a.uuid(), b.uuid());
    }
}

#[test]
fn caller_plan_keeps_instructions_issued_before_a_failure() {
    let request = InterpretRequest::script("(def run (plan) (plan.print \"first\") (fail \"late\"))");
    let mut plan = InstructionsPlan::new();
    let err = interpreter()
        .interpret_into(&request, &mut EnclaveComponents::new(), &InstructionsPlanMask::default(), &mut plan)
        .unwrap_err();
    assert!(err.message().unwrap().contains("fail: late"));
    assert_eq!(plan.size(), 1);
}

#[test]
fn syntax_errors_point_at_the_source() {
    let err = interpret(&interpreter(), &InterpretRequest::script("(def run (plan)\n  (plan.print \"x\")")).unwrap_err();
    assert!(err.message().is_none());
    assert_eq!(err.stacktrace().len(), 1);
    assert_eq!(err.stacktrace()[0].position.filename, "DEFAULT_PACKAGE_ID_FOR_SCRIPT");
}

#[test]
fn several_unbound_names_use_the_banner() {
    let err = interpret(&interpreter(), &InterpretRequest::script("(def run (plan) (foo) (bar))")).unwrap_err();
    assert_eq!(err.message(), Some(MULTIPLE_INTERPRETATION_ERRORS_MSG));
    let names: Vec<&str> = err.stacktrace().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["undefined: foo", "undefined: bar"]);
}

#[test]
fn errors_in_imported_modules_are_prefixed_once() {
    let provider = InMemoryPackageContentProvider::new()
        .with_module("github.com/org/pkg/lib.star", "(fail \"broken\")");
    let request = InterpretRequest::package(
        PKG,
        "main.star",
        "(let lib (import_module \"./lib.star\"))\n(def run (plan) None)",
    );
    let err = interpret(&interpreter_with(provider), &request).unwrap_err();
    let message = err.message().unwrap();
    assert!(message.starts_with("Evaluation error: fail: broken"));
    assert!(!message.contains("Evaluation error: Evaluation error"));
    assert!(
        err.stacktrace()
            .iter()
            .all(|frame| frame.name != SKIP_IMPORT_INSTRUCTION_IN_STACKTRACE)
    );
}

#[test]
fn imported_functions_can_use_the_plan() {
    let provider = InMemoryPackageContentProvider::new().with_module(
        "github.com/org/pkg/lib/db.star",
        "(def launch (plan name) (plan.add_service name (ServiceConfig \"postgres\")))",
    );
    let request = InterpretRequest::package(
        PKG,
        "main.star",
        "(let db (import_module \"./lib/db.star\"))\n(def run (plan) (db.launch plan \"pg\") None)",
    );
    let result = interpret(&interpreter_with(provider), &request).unwrap();
    assert_eq!(result.plan.size(), 1);
}

#[test]
fn print_and_load_statements_are_disabled() {
    let err = interpret(&interpreter(), &InterpretRequest::script("(def run (plan) (print \"hi\"))")).unwrap_err();
    assert_eq!(err.message(), Some(format!("Evaluation error: {}", PRINT_DISABLED_MSG).as_str()));

    let err = interpret(&interpreter(), &InterpretRequest::script("(load \"lib.star\" x)\n(def run (plan) None)")).unwrap_err();
    assert_eq!(err.message(), Some(format!("Evaluation error: {}", LOAD_DISABLED_MSG).as_str()));
}

#[test]
fn step_limit_aborts_runaway_scripts() {
    let config = InterpreterConfig {
        max_steps: Some(200),
        ..InterpreterConfig::default()
    };
    let interpreter = Interpreter::new(Arc::new(InMemoryPackageContentProvider::new()), config);
    let request = InterpretRequest::script("(def run (plan) (for i (range 1000) (+ i 1)))");
    let err = interpret(&interpreter, &request).unwrap_err();
    assert_eq!(err.message(), Some(format!("Evaluation error: {}", TOO_MANY_STEPS_MSG).as_str()));
}

#[test]
fn recursive_functions_fail_cleanly() {
    let request = InterpretRequest::script("(def loop_forever (n) (loop_forever n))\n(def run (plan) (loop_forever 1))");
    let err = interpret(&interpreter(), &request).unwrap_err();
    assert_eq!(err.message(), Some("Evaluation error: function loop_forever called recursively"));

    let request = InterpretRequest::script("(def run (plan) (run plan))");
    let err = interpret(&interpreter(), &request).unwrap_err();
    assert_eq!(err.message(), Some("Evaluation error: function run called recursively"));
}

#[test]
fn deeply_nested_scripts_are_syntax_errors() {
    let depth = 100_000;
    let script = format!("(def run (plan) {}1{})", "(do ".repeat(depth), ")".repeat(depth));
    let err = interpret(&interpreter(), &InterpretRequest::script(script)).unwrap_err();
    assert!(err.message().is_none());
    assert!(err.stacktrace()[0].name.contains("nesting exceeds"));
}

#[test]
fn integer_overflow_is_an_evaluation_error() {
    for (expr, op) in [
        ("(* 9223372036854775807 2)", "*"),
        ("(+ 9223372036854775807 1)", "+"),
        ("(- (- 0 9223372036854775807) 2)", "-"),
    ] {
        let request = InterpretRequest::script(format!("(def run (plan) {})", expr));
        let err = interpret(&interpreter(), &request).unwrap_err();
        let message = err.message().unwrap();
        assert!(message.starts_with("Evaluation error:"), "{}", message);
        assert!(message.contains(&format!("{}: integer overflow", op)), "{}", message);
    }
}

#[test]
fn enclave_handle_and_builtins_processor() {
    let mut config = InterpreterConfig::default();
    config.enclave_env_vars.insert("REGION".into(), "eu-west".into());
    let interpreter = Interpreter::new(Arc::new(InMemoryPackageContentProvider::new()), config)
        .with_builtins_processor(Arc::new(|mut predeclared: Namespace| {
            predeclared.insert("answer".to_string(), Value::Int(42));
            predeclared
        }));

    let request = InterpretRequest::script("(def run (plan) (list (get enclave.env_vars \"REGION\") answer))");
    let result = interpret(&interpreter, &request).unwrap();
    assert_eq!(result.serialized_output, r#"["eu-west",42]"#);
}

#[test]
fn cross_package_imports_record_dependencies() {
    let provider = InMemoryPackageContentProvider::new()
        .with_module("github.com/fork/dep/lib.star", "(let port 5432)")
        .with_module("github.com/org/pkg/util.star", "(let x 1)");
    let mut replace = BTreeMap::new();
    replace.insert("github.com/org/dep".to_string(), "github.com/fork/dep".to_string());
    let request = InterpretRequest::package(
        PKG,
        "main.star",
        "(let dep (import_module \"github.com/org/dep/lib.star\"))\n(let util (import_module \"./util.star\"))\n(def run (plan) dep.port)",
    )
    .with_replace_options(replace);

    let result = interpret(&interpreter_with(provider), &request).unwrap();
    assert_eq!(result.serialized_output, "5432");
    let deps: Vec<&str> = result.plan.package_dependencies().collect();
    assert_eq!(deps, vec!["github.com/fork/dep"]);
}

#[test]
fn interpreters_can_be_shared_across_threads() {
    let interpreter = Arc::new(interpreter());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let interpreter = Arc::clone(&interpreter);
            std::thread::spawn(move || {
                let request = InterpretRequest::script(format!("(def run (plan) (plan.print \"worker {}\") {})", i, i));
                interpret(&interpreter, &request).map(|r| r.serialized_output)
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap().unwrap(), i.to_string());
    }
}
