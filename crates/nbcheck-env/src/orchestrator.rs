//! Prepare a sandbox, install dependencies and run notebooks inside it.

use crate::error::Error;
use crate::install::{InstallSpec, Installer};
use crate::process::ProcessOutput;
use crate::sandbox::Sandbox;
use crate::shell::{shell_join, single_quote};
use nbcheck_core::{LogContext, NotebookReport};
use std::path::Path;
use tracing::{debug, error, info, warn};

pub const REASON_PREPARE: &str = "<Failed to prepare environment>";
pub const REASON_INSTALL: &str = "<Install Dependency Error>";
pub const REASON_NO_NOTEBOOKS: &str = "<no notebooks were specified>";
pub const REASON_RUN_FAILED: &str = "<Failed to run notebook>";
pub const REASON_PARSE_FAILED: &str = "<Failed to parse results>";

/// What a whole batch produced. Only [`BatchOutcome::Notebooks`] carries
/// per-notebook results.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    PrepareFailed { reason: String, msg: String },
    InstallFailed { reason: String, msg: String },
    NoNotebooks,
    DryRun,
    Notebooks(Vec<(String, NotebookReport)>),
}

impl BatchOutcome {
    /// Machine-stable failure code, if the batch did not reach the notebooks.
    pub fn fail_code(&self) -> Option<&'static str> {
        match self {
            BatchOutcome::PrepareFailed { .. } => Some("prepare-env"),
            BatchOutcome::InstallFailed { .. } => Some("install"),
            BatchOutcome::NoNotebooks => Some("no-notebooks"),
            BatchOutcome::DryRun => Some("dryrun"),
            BatchOutcome::Notebooks(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub dry_run_install: bool,
    pub dry_run_execute: bool,
    /// Shell command that installs the tool itself into the sandbox.
    pub tool_install: Option<String>,
    /// Program invoked inside the sandbox for `run` and `extract-pipenv`.
    pub tool: String,
    pub log: LogContext,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            dry_run_install: false,
            dry_run_execute: false,
            tool_install: None,
            tool: "nbcheck".to_string(),
            log: LogContext::default(),
        }
    }
}

/// Entered sandbox that must be handed back through [`Lease::release`].
///
/// `exit()` is async and cannot run from `Drop`; a lease dropped early (a
/// panic, or the batch future being cancelled) only records that teardown
/// is owed, and the orchestrator settles it on its next call.
struct Lease<'a> {
    sandbox: &'a mut dyn Sandbox,
    owed: &'a mut bool,
    released: bool,
}

impl<'a> Lease<'a> {
    fn new(sandbox: &'a mut dyn Sandbox, owed: &'a mut bool) -> Self {
        Lease {
            sandbox,
            owed,
            released: false,
        }
    }

    fn sandbox(&self) -> &dyn Sandbox {
        &*self.sandbox
    }

    async fn release(mut self) {
        self.released = true;
        if self.sandbox.lifecycle().remove {
            self.sandbox.exit().await;
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.released && self.sandbox.lifecycle().remove {
            *self.owed = true;
            warn!(sandbox = %self.sandbox.report(), "batch interrupted before sandbox teardown");
        }
    }
}

pub struct Orchestrator {
    sandbox: Box<dyn Sandbox>,
    options: OrchestratorOptions,
    teardown_owed: bool,
}

impl Orchestrator {
    pub fn new(sandbox: Box<dyn Sandbox>, options: OrchestratorOptions) -> Self {
        Orchestrator {
            sandbox,
            options,
            teardown_owed: false,
        }
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    /// Whether an interrupted batch left its sandbox standing.
    pub fn teardown_owed(&self) -> bool {
        self.teardown_owed
    }

    /// Tears down a sandbox kept alive with `remove=false`, or one left
    /// behind by an interrupted batch. Otherwise the batch already did it.
    pub async fn finish(&mut self) {
        if self.sandbox.lifecycle().remove && !self.teardown_owed {
            return;
        }
        self.teardown_owed = false;
        self.sandbox.exit().await;
    }

    /// Runs one batch. The sandbox is released exactly once on every path
    /// when its lifecycle asks for removal.
    pub async fn execute_environment(
        &mut self,
        cwd: &Path,
        install: &InstallSpec,
        notebooks: &[String],
        args: &[String],
    ) -> BatchOutcome {
        if std::mem::take(&mut self.teardown_owed) {
            self.sandbox.exit().await;
        }
        let options = self.options.clone();
        let mut lease = Lease::new(self.sandbox.as_mut(), &mut self.teardown_owed);
        let entered = lease.sandbox.enter().await;
        let outcome = match entered {
            Err(err) => {
                let msg = match err {
                    Error::PrepareEnvironment { message, .. } => message,
                    other => other.to_string(),
                };
                error!("{} Failed to prepare environment due '{}'", options.log.prefix(), msg);
                BatchOutcome::PrepareFailed {
                    reason: REASON_PREPARE.to_string(),
                    msg,
                }
            }
            Ok(_) => run_phases(lease.sandbox(), &options, cwd, install, notebooks, args).await,
        };
        lease.release().await;
        outcome
    }
}

async fn run_phases(
    sandbox: &dyn Sandbox,
    options: &OrchestratorOptions,
    cwd: &Path,
    install: &InstallSpec,
    notebooks: &[String],
    args: &[String],
) -> BatchOutcome {
    let log = options.log;
    info!(
        "{} {}Installing repository dependencies",
        log.prefix(),
        if options.dry_run_install { "[DRY RUN] " } else { "" }
    );
    if !options.dry_run_install {
        let installer = Installer::new(sandbox, cwd, &options.tool, log)
            .with_tool_install(options.tool_install.clone());
        match installer.install(install).await {
            Ok(ok) => debug!(installed = ?ok, "dependencies installed"),
            Err(err) => {
                let msg = match err {
                    Error::Install(msg) => msg,
                    other => other.to_string(),
                };
                return BatchOutcome::InstallFailed {
                    reason: REASON_INSTALL.to_string(),
                    msg,
                };
            }
        }
    }
    if notebooks.is_empty() {
        return BatchOutcome::NoNotebooks;
    }
    execute_notebooks(sandbox, options, cwd, notebooks, args).await
}

/// Options forwarded to the nested `run`, with verbosity and indentation
/// filled in when the caller left them out.
fn forwarded_args(args: &[String], log: LogContext) -> Vec<String> {
    let mut out = args.to_vec();
    if let Some(verbose) = log.verbose {
        if !args.iter().any(|a| a == "-v" || a == "--verbose") {
            out.push("-v".to_string());
            out.push(verbose.to_string());
        }
    }
    if !args.iter().any(|a| a == "-i" || a == "--indent") {
        out.push("-i".to_string());
        out.push((log.indent + 1).to_string());
    }
    out
}

async fn execute_notebooks(
    sandbox: &dyn Sandbox,
    options: &OrchestratorOptions,
    cwd: &Path,
    notebooks: &[String],
    args: &[String],
) -> BatchOutcome {
    let log = options.log;
    info!(
        "{} {}Running {} notebooks",
        log.prefix(),
        if options.dry_run_execute { "[DRY RUN] " } else { "" },
        notebooks.len()
    );
    let args = shell_join(&forwarded_args(args, log));
    if options.dry_run_execute {
        for notebook in notebooks {
            info!("{} [DRY RUN] Would run notebook {} {}", log.child().prefix(), notebook, args);
        }
        return BatchOutcome::DryRun;
    }

    let project = sandbox.project_path(cwd);
    let mut results = Vec::with_capacity(notebooks.len());
    for notebook in notebooks {
        info!("{} Running notebook {}", log.prefix(), notebook);
        let command = format!(
            "{} run {} -w ejson {}",
            options.tool,
            single_quote(&project.join(notebook).display().to_string()),
            args
        );
        let report = match sandbox.run(&command).await {
            Ok(output) => read_report(&output),
            Err(err) => NotebookReport::synthesized_failure(
                REASON_RUN_FAILED,
                ProcessOutput {
                    code: None,
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                }
                .combined(),
            ),
        };
        results.push((notebook.clone(), report));
    }
    BatchOutcome::Notebooks(results)
}

fn read_report(output: &ProcessOutput) -> NotebookReport {
    if let Some(report) = NotebookReport::from_stdout(&output.stdout_text()) {
        return report;
    }
    let reason = if output.success() {
        REASON_PARSE_FAILED
    } else {
        REASON_RUN_FAILED
    };
    NotebookReport::synthesized_failure(reason, output.combined())
}
