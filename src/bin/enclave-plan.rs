//! Enclave Plan CLI - interpret enclave scripts and reconcile them against
//! the enclave history kept in a state directory.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use enclave_plan::engine::packages::PackageContentProvider;
use enclave_plan::engine::storage::{Storage, init_storage};
use enclave_plan::engine::{
    EnclaveComponents, EnclavePlan, ImageDownloadMode, InstructionsPlan, InstructionsPlanMask,
    InterpretRequest, Interpreter, InterpreterConfig, LocalPackageContentProvider,
    PackageReplaceOptions,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "enclave-plan")]
#[command(about = "Interpret enclave scripts and compute incremental plans", long_about = None)]
struct Cli {
    /// State directory holding config.json and history.json
    #[arg(short, long, default_value = ".enclave")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory and its configuration
    Init {
        /// Evaluation step budget per module
        #[arg(long)]
        max_steps: Option<u64>,

        /// Enclave environment variable, as KEY=VALUE
        #[arg(long = "env", value_parser = parse_key_value)]
        env_vars: Vec<(String, String)>,
    },

    /// Interpret a script once, ignoring history
    Interpret(ScriptArgs),

    /// Reconcile a script against the enclave history
    Plan {
        #[command(flatten)]
        script: ScriptArgs,

        /// Persist the reconciled plan into the history
        #[arg(long)]
        apply: bool,
    },

    /// Show the enclave history
    History,
}

#[derive(Args)]
struct ScriptArgs {
    /// Standalone script file
    #[arg(long, conflicts_with = "package")]
    script: Option<PathBuf>,

    /// Package id, e.g. github.com/org/pkg
    #[arg(long)]
    package: Option<String>,

    /// Main file inside the package
    #[arg(long, default_value = "main.star")]
    main_file: String,

    /// Directory packages are read from
    #[arg(long, default_value = ".")]
    packages: PathBuf,

    /// Entry function (defaults to run)
    #[arg(long, default_value = "")]
    main_function: String,

    /// JSON parameters
    #[arg(long, default_value = "")]
    params: String,

    /// Package replacement, as PACKAGE=REPLACEMENT
    #[arg(long = "replace", value_parser = parse_key_value)]
    replacements: Vec<(String, String)>,

    /// Do not wait for readiness checks
    #[arg(long)]
    non_blocking: bool,

    /// Pull images always instead of only when missing
    #[arg(long)]
    always_pull: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { max_steps, env_vars } => {
            let storage = init_storage(&cli.root)?;
            let config = InterpreterConfig {
                max_steps,
                enclave_env_vars: env_vars.into_iter().collect(),
                ..InterpreterConfig::default()
            };
            config.save(&storage, &storage.config_path())?;
            println!("Initialized enclave {} at {:?}", config.enclave_id, cli.root);
        }

        Commands::Interpret(args) => {
            let storage = Storage::new(cli.root);
            let (interpreter, request) = prepare(&storage, &args)?;
            let interpretation = interpreter.interpret(
                &request,
                &mut EnclaveComponents::new(),
                &InstructionsPlanMask::default(),
            )?;
            print_plan(&interpretation.plan)?;
            print_output(&interpretation.serialized_output);
        }

        Commands::Plan { script, apply } => {
            let storage = Storage::new(cli.root);
            let (interpreter, request) = prepare(&storage, &script)?;
            let history_path = storage.history_path();
            let mut history = EnclavePlan::load(&storage, &history_path)?;

            let interpretation = interpreter.interpret_and_optimize_plan(&request, &history)?;
            println!(
                "Keeping {} of {} historical instructions",
                interpretation.plan.index_of_first_instruction(),
                history.size()
            );
            print_plan(&interpretation.plan)?;
            print_output(&interpretation.serialized_output);

            if apply {
                history.apply(&interpretation.plan)?;
                history.save(&storage, &history_path)?;
                println!("Enclave history now holds {} instructions", history.size());
            }
        }

        Commands::History => {
            let storage = Storage::new(cli.root);
            let history = EnclavePlan::load(&storage, &storage.history_path())?;
            println!("Enclave history ({} instructions):", history.size());
            for (idx, entry) in history.generate_plan().iter().enumerate() {
                let applied = entry
                    .applied_at()
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {:>3}  {}  {}  {}", idx, entry.uuid(), applied, entry.instruction());
            }
        }
    }

    Ok(())
}

fn prepare(storage: &Storage, args: &ScriptArgs) -> Result<(Interpreter, InterpretRequest)> {
    let config = if storage.config_path().exists() {
        InterpreterConfig::load(storage, &storage.config_path())?
    } else {
        InterpreterConfig::default()
    };
    let provider = LocalPackageContentProvider::new(args.packages.clone());

    let mut request = match (&args.script, &args.package) {
        (Some(path), None) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script: {:?}", path))?;
            InterpretRequest::script(source)
        }
        (None, Some(package)) => {
            let locator = format!("{}/{}", package, args.main_file);
            let source = provider
                .get_module_contents(&locator)
                .with_context(|| format!("Failed to read main file of package {}", package))?;
            InterpretRequest::package(package.clone(), args.main_file.clone(), source)
        }
        _ => bail!("Pass exactly one of --script or --package"),
    };

    let replacements: PackageReplaceOptions = args.replacements.iter().cloned().collect();
    request = request
        .with_main_function(args.main_function.clone())
        .with_params(args.params.clone())
        .with_replace_options(replacements)
        .with_non_blocking(args.non_blocking)
        .with_image_download_mode(if args.always_pull {
            ImageDownloadMode::Always
        } else {
            ImageDownloadMode::Missing
        });

    Ok((Interpreter::new(Arc::new(provider), config), request))
}

fn print_plan(plan: &InstructionsPlan) -> Result<()> {
    let sequence = plan.generate_plan()?;
    println!("Plan ({} instructions):", sequence.len());
    for scheduled in sequence {
        let marker = if scheduled.is_executed() { "=" } else { "+" };
        println!("  {} {}", marker, scheduled.instruction());
    }
    let deps: Vec<&str> = plan.package_dependencies().collect();
    if !deps.is_empty() {
        println!("Package dependencies: {}", deps.join(", "));
    }
    Ok(())
}

fn print_output(output: &str) {
    if !output.is_empty() {
        println!("Output: {}", output);
    }
}
