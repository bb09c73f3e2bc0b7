mod config;
mod relay;
mod view;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::Config;
use nbcheck_core::runner::DEFAULT_NOTEBOOK_TIMEOUT;
use nbcheck_core::{ExecutionOrder, JupyterLauncher, LogContext, Runner, RunnerOptions};
use nbcheck_env::install::PIPENV_REQUIREMENTS;
use nbcheck_env::summary::exit_code;
use nbcheck_env::{
    discover_notebooks, discover_spec, BatchOutcome, BatchSummary, CommandRunner, CondaSandbox,
    DockerSandbox, Lifecycle, ManifestKind, Orchestrator, OrchestratorOptions, Sandbox, StreamKind,
    TokioCommandRunner, VenvSandbox, DISCOVER,
};
use relay::RelayRecord;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use view::ViewOptions;

#[derive(Parser)]
#[command(name = "nbcheck", version, about = "Re-execute Jupyter notebooks and check that they reproduce")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ViewArg {
    Simple,
    Json,
    Ejson,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EnvMode {
    Run,
    Prepare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SandboxArg {
    Docker,
    Conda,
    Venv,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Notebook path
    path: PathBuf,
    /// Cell order: a(ll), t(opdown, numbered cells only) or e(xecution count)
    #[arg(short, long)]
    order: Option<String>,
    /// Do not neutralize process-killing calls before running cells
    #[arg(short, long = "unsafe")]
    unsafe_mode: bool,
    #[arg(short, long)]
    kernel: Option<String>,
    /// Do not fall back to other kernels when the requested one is missing
    #[arg(short, long)]
    force_fail: bool,
    /// Notebook timeout in seconds
    #[arg(short, long)]
    timeout: Option<f64>,
    /// Normalization chain, in order
    #[arg(short, long, num_args = 1..)]
    normalizations: Vec<String>,
    /// Stages that get a similarity score
    #[arg(short = 's', long = "similarity", num_args = 1..)]
    similarity: Vec<String>,
    /// Write per-cell mismatch files next to the notebook
    #[arg(short = 'r', long)]
    show_report: bool,
    #[arg(short = 'x', long)]
    skip_comparison: bool,
    #[arg(short = 'w', long, value_enum, default_value_t = ViewArg::Simple)]
    view: ViewArg,
    #[arg(short, long)]
    verbose: Option<u8>,
    /// Log nesting depth when invoked by `env`
    #[arg(short, long, default_value_t = 0)]
    indent: usize,
    #[arg(long)]
    hide_message: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct EnvArgs {
    #[arg(value_enum)]
    mode: EnvMode,
    #[arg(value_enum)]
    sandbox: SandboxArg,
    /// Notebooks relative to --dir
    #[arg(default_values_t = [DISCOVER.to_string()])]
    notebooks: Vec<String>,
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
    #[arg(short = 's', long, num_args = 0.., default_values_t = [DISCOVER.to_string()])]
    setups: Vec<String>,
    #[arg(short = 'r', long, num_args = 0.., default_values_t = [DISCOVER.to_string()])]
    requirements: Vec<String>,
    #[arg(short = 'p', long, num_args = 0.., default_values_t = [DISCOVER.to_string()])]
    pipfiles: Vec<String>,
    #[arg(short = 'l', long, num_args = 0.., default_values_t = [DISCOVER.to_string()])]
    pipfile_locks: Vec<String>,
    /// Docker image, or the container id when reusing one
    #[arg(long, default_value = "python:3.8")]
    image: String,
    /// Mount point of the project inside the container
    #[arg(long, default_value = nbcheck_env::sandbox::DEFAULT_WORKDIR)]
    target_dir: String,
    #[arg(long, default_value = "nbcheck-env")]
    envname: String,
    /// Creation command (venv) or `conda create` arguments (conda)
    #[arg(long)]
    create_operation: Option<String>,
    #[arg(long, default_value = "/opt/conda")]
    conda_path: PathBuf,
    /// Reuse an existing target instead of creating one
    #[arg(long)]
    reuse: bool,
    /// Command that installs nbcheck inside the sandbox
    #[arg(long)]
    tool_install: Option<String>,
    #[arg(long, default_value = "nbcheck")]
    tool: String,
    #[arg(long)]
    dry_run_install: bool,
    #[arg(long)]
    dry_run_execute: bool,
    /// Stream subprocess output while it runs
    #[arg(long)]
    full_outputs: bool,
    #[arg(short = 'w', long, value_enum, default_value_t = ViewArg::Simple)]
    view: ViewArg,
    #[arg(short, long)]
    verbose: Option<u8>,
    #[arg(short, long, default_value_t = 0)]
    indent: usize,
    #[arg(long)]
    hide_message: bool,
    #[arg(long)]
    json: bool,
    /// Options forwarded to `nbcheck run`
    #[arg(last = true)]
    execution_options: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a notebook and check whether it reproduces its stored outputs
    Run(RunArgs),
    /// Prepare a sandbox, install dependencies and run notebooks inside it
    Env(EnvArgs),
    /// Convert a Pipfile into a requirements file next to it
    ExtractPipenv {
        #[arg(short, long, default_value = "Pipfile.lock")]
        path: PathBuf,
        #[arg(short, long, default_value = PIPENV_REQUIREMENTS)]
        output: String,
        #[arg(long)]
        json: bool,
    },
}

/// Exit status plus what the relay should record about the command.
struct CommandOutcome {
    code: i32,
    payload: Option<Value>,
    notebooks: Vec<String>,
    summary: Option<BatchSummary>,
}

impl CommandOutcome {
    fn code(code: i32) -> Self {
        CommandOutcome {
            code,
            payload: None,
            notebooks: Vec::new(),
            summary: None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    init_tracing(command_log(&cli.command));

    let cwd = std::env::current_dir()?;
    let home = config::home_config_dir();
    let config = Config::load(home.as_deref(), &cwd);
    let operation = command_name(&cli.command);

    match run_command(cli.command, &config) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            let record = RelayRecord::new(operation, outcome.code, &outcome.notebooks, outcome.summary);
            relay::relay(&record, &config.experiment, home.as_deref());
            std::process::exit(outcome.code);
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(log: LogContext) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.filter_directive()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn command_log(command: &Commands) -> LogContext {
    match command {
        Commands::Run(args) => LogContext::new(args.verbose, args.indent),
        Commands::Env(args) => LogContext::new(args.verbose, args.indent),
        Commands::ExtractPipenv { .. } => LogContext::default(),
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Run(_) => "run",
        Commands::Env(_) => "env",
        Commands::ExtractPipenv { .. } => "extract-pipenv",
    }
}

fn run_command(command: Commands, config: &Config) -> Result<CommandOutcome> {
    match command {
        Commands::Run(args) => run_notebook(&args, config),
        Commands::Env(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_env(&args))
        }
        Commands::ExtractPipenv { path, output, json } => {
            let code = extract_pipenv(&path, &output)?;
            let mut outcome = CommandOutcome::code(code);
            if json {
                outcome.payload = Some(json!({
                    "ok": code == 0,
                    "command": "extract-pipenv",
                    "output": requirements_target(&path, &output).display().to_string(),
                    "exit_code": code,
                }));
            }
            Ok(outcome)
        }
    }
}

fn runner_options(args: &RunArgs, config: &Config) -> Result<RunnerOptions> {
    let defaults = RunnerOptions::default();
    let order = match args.order.as_deref().or(config.run.order.as_deref()) {
        Some(name) => name.parse::<ExecutionOrder>().map_err(anyhow::Error::msg)?,
        None => defaults.order,
    };
    let notebook_timeout = match args.timeout.or(config.run.timeout) {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .with_context(|| format!("invalid timeout: {}", secs))?,
        None => DEFAULT_NOTEBOOK_TIMEOUT,
    };
    let pick = |flag: &Vec<String>, configured: &Option<Vec<String>>, fallback: Vec<String>| {
        if !flag.is_empty() {
            flag.clone()
        } else {
            configured.clone().unwrap_or(fallback)
        }
    };
    Ok(RunnerOptions {
        order,
        unsafe_mode: args.unsafe_mode,
        kernel: args.kernel.clone().or_else(|| config.run.kernel.clone()),
        force_fail: args.force_fail,
        notebook_timeout,
        normalizations: pick(&args.normalizations, &config.run.normalizations, defaults.normalizations),
        similarity: pick(&args.similarity, &config.run.similarity, defaults.similarity),
        show_report: args.show_report,
        skip_comparison: args.skip_comparison,
        log: LogContext::new(args.verbose, args.indent),
    })
}

fn run_notebook(args: &RunArgs, config: &Config) -> Result<CommandOutcome> {
    let options = runner_options(args, config)?;
    let mut runner = Runner::new(&args.path, options, Box::new(JupyterLauncher::default()));
    let code = runner.run();
    let report = runner.into_report();

    let mut outcome = CommandOutcome::code(code);
    outcome.notebooks = vec![args.path.display().to_string()];
    match args.view {
        ViewArg::Simple => {
            let view = ViewOptions {
                hide_message: args.hide_message,
                skip_comparison: args.skip_comparison,
            };
            for line in view::simple_view(&report, view, 0) {
                println!("{}", line);
            }
        }
        ViewArg::Json => println!("{}", serde_json::to_string(&report)?),
        ViewArg::Ejson => println!("{}", report.to_ejson()?),
    }
    Ok(outcome)
}

fn skips_comparison(execution_options: &[String]) -> bool {
    execution_options
        .iter()
        .any(|o| o == "-x" || o == "--skip-comparison")
}

fn command_runner(full_outputs: bool) -> Arc<dyn CommandRunner> {
    if !full_outputs {
        return Arc::new(TokioCommandRunner::new());
    }
    // stdout stays reserved for the result payload
    Arc::new(TokioCommandRunner::with_display(Arc::new(|_: StreamKind, chunk: &[u8]| {
        let _ = std::io::stderr().write_all(chunk);
    })))
}

fn build_sandbox(args: &EnvArgs, project: &Path, runner: Arc<dyn CommandRunner>) -> Box<dyn Sandbox> {
    let lifecycle = Lifecycle {
        create: !args.reuse,
        remove: args.mode != EnvMode::Prepare,
    };
    match args.sandbox {
        SandboxArg::Docker => Box::new(DockerSandbox::new(
            &args.image,
            project,
            &args.target_dir,
            lifecycle,
            runner,
        )),
        SandboxArg::Conda => Box::new(CondaSandbox::new(
            &args.envname,
            args.create_operation.as_deref().unwrap_or("python=3.8 jupyter"),
            &args.conda_path,
            lifecycle,
            runner,
        )),
        SandboxArg::Venv => Box::new(VenvSandbox::new(
            args.create_operation.as_deref().unwrap_or("python3 -m venv"),
            project.join(&args.envname),
            lifecycle,
            runner,
        )),
    }
}

async fn run_env(args: &EnvArgs) -> Result<CommandOutcome> {
    let log = LogContext::new(args.verbose, args.indent);
    let project = args.dir.canonicalize().unwrap_or_else(|_| args.dir.clone());

    let mut requested = BTreeMap::new();
    requested.insert(ManifestKind::SetupPy, args.setups.clone());
    requested.insert(ManifestKind::Requirements, args.requirements.clone());
    requested.insert(ManifestKind::Pipfile, args.pipfiles.clone());
    requested.insert(ManifestKind::PipfileLock, args.pipfile_locks.clone());
    let install = discover_spec(&project, &requested)?;
    let notebooks = match args.mode {
        EnvMode::Prepare => Vec::new(),
        EnvMode::Run => discover_notebooks(&project, &args.notebooks)?,
    };

    let sandbox = build_sandbox(args, &project, command_runner(args.full_outputs));
    let options = OrchestratorOptions {
        dry_run_install: args.dry_run_install,
        dry_run_execute: args.dry_run_execute,
        tool_install: args.tool_install.clone(),
        tool: args.tool.clone(),
        log,
    };
    let mut orchestrator = Orchestrator::new(sandbox, options);
    let outcome = orchestrator
        .execute_environment(&project, &install, &notebooks, &args.execution_options)
        .await;

    let skip_comparison = skips_comparison(&args.execution_options);
    let view = ViewOptions {
        hide_message: args.hide_message,
        skip_comparison,
    };
    let prepare_only = args.mode == EnvMode::Prepare;
    let mut result = CommandOutcome::code(exit_code(&outcome, skip_comparison));
    match args.view {
        ViewArg::Simple => {
            for line in view::batch_view(&outcome, prepare_only, view) {
                println!("{}", line);
            }
        }
        ViewArg::Json | ViewArg::Ejson => println!("{}", serde_json::to_string(&view::outcome_to_json(&outcome))?),
    }
    if prepare_only {
        eprintln!("{}", orchestrator.sandbox().report());
    }
    if let BatchOutcome::Notebooks(results) = &outcome {
        result.summary = Some(BatchSummary::from_reports(results.iter().map(|(_, r)| r), skip_comparison));
    }
    result.notebooks = notebooks;
    if args.json {
        result.payload = Some(json!({
            "ok": result.code == 0,
            "command": "env",
            "exit_code": result.code,
            "sandbox": orchestrator.sandbox().report(),
        }));
    }
    Ok(result)
}

fn requirements_target(pipfile: &Path, output: &str) -> PathBuf {
    let parent = pipfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parent.join(output)
}

/// Writes `pipenv lock -r` output next to the Pipfile and returns its exit code.
fn extract_pipenv(pipfile: &Path, output: &str) -> Result<i32> {
    if !pipfile.exists() {
        bail!("pipenv file not found: {}", pipfile.display());
    }
    let target = requirements_target(pipfile, output);
    let file = fs::File::create(&target).with_context(|| format!("failed to create {}", target.display()))?;
    let parent = target.parent().unwrap_or(Path::new("."));
    let status = Command::new("pipenv")
        .args(["lock", "-r"])
        .current_dir(parent)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::inherit())
        .status()
        .context("failed to run pipenv")?;
    Ok(status.code().unwrap_or(1))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) => args.json,
        Commands::Env(args) => args.json,
        Commands::ExtractPipenv { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Commands {
        Cli::try_parse_from(argv).expect("parse").command
    }

    #[test]
    fn run_flags_override_config() {
        let Commands::Run(args) = parse(&["nbcheck", "run", "nb.ipynb", "-o", "e", "-t", "30", "-n", "image", "date"]) else {
            panic!("expected run");
        };
        let mut config = Config::default();
        config.run.order = Some("a".into());
        config.run.similarity = Some(vec!["image".into()]);
        config.run.kernel = Some("python3".into());
        let options = runner_options(&args, &config).expect("options");
        assert_eq!(options.order, ExecutionOrder::ExecutionCount);
        assert_eq!(options.notebook_timeout, Duration::from_secs(30));
        assert_eq!(options.normalizations, vec!["image", "date"]);
        assert_eq!(options.similarity, vec!["image"]);
        assert_eq!(options.kernel.as_deref(), Some("python3"));
    }

    #[test]
    fn run_rejects_bad_order_and_timeout() {
        let Commands::Run(args) = parse(&["nbcheck", "run", "nb.ipynb", "-o", "sideways"]) else {
            panic!("expected run");
        };
        assert!(runner_options(&args, &Config::default()).is_err());
        let Commands::Run(args) = parse(&["nbcheck", "run", "nb.ipynb", "-t", "0"]) else {
            panic!("expected run");
        };
        assert!(runner_options(&args, &Config::default()).is_err());
    }

    #[test]
    fn env_defaults_discover_everything() {
        let Commands::Env(args) = parse(&["nbcheck", "env", "run", "venv", "--", "-x", "-n", "image"]) else {
            panic!("expected env");
        };
        assert_eq!(args.notebooks, vec![DISCOVER]);
        assert_eq!(args.requirements, vec![DISCOVER]);
        assert_eq!(args.execution_options, vec!["-x", "-n", "image"]);
        assert!(skips_comparison(&args.execution_options));
        assert!(!args.reuse);
    }

    #[test]
    fn prepare_mode_keeps_the_sandbox() {
        let Commands::Env(args) = parse(&["nbcheck", "env", "prepare", "docker", "--image", "py"]) else {
            panic!("expected env");
        };
        let sandbox = build_sandbox(&args, Path::new("/p"), Arc::new(TokioCommandRunner::new()));
        assert_eq!(sandbox.lifecycle(), Lifecycle { create: true, remove: false });
    }

    #[test]
    fn requirements_land_next_to_the_pipfile() {
        assert_eq!(
            requirements_target(Path::new("app/Pipfile"), PIPENV_REQUIREMENTS),
            PathBuf::from("app/_nbcheck_requirements.txt")
        );
        assert_eq!(
            requirements_target(Path::new("Pipfile.lock"), "req.txt"),
            PathBuf::from("./req.txt")
        );
    }
}
