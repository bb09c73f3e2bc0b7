//! Re-executes one notebook and compares it against the outputs it was saved with.

use crate::compare::{write_mismatch_report, CellComparison, ComparisonEngine};
use crate::compare::{DEFAULT_NORMALIZATION, DEFAULT_SIMILARITY};
use crate::error::{Error, Result};
use crate::kernel::{CellRun, Kernel, KernelLauncher};
use crate::log::LogContext;
use crate::notebook::{Baseline, Notebook, OutputKind};
use crate::order::{safety_strategy, ExecutionOrder, SafetyStrategy};
use crate::results::{
    DiffFlag, DiffResult, ExecutionFlag, ExecutionResult, ExecutionStatus, FailInfo,
    NotebookReport,
};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_NOTEBOOK_TIMEOUT: Duration = Duration::from_secs(300);

pub const REASON_READ: &str = "<Read notebook error>";
pub const REASON_NO_KERNEL: &str = "<No available kernel>";
pub const REASON_SKIP: &str = "<Skipping notebook>";
pub const REASON_RUNTIME: &str = "RuntimeError";
pub const REASON_MALFORMED: &str = "Malformed Notebook";
pub const REASON_UNKNOWN_EXCEPTION: &str = "<Unknown exception>";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub order: ExecutionOrder,
    pub unsafe_mode: bool,
    pub kernel: Option<String>,
    pub force_fail: bool,
    pub notebook_timeout: Duration,
    pub normalizations: Vec<String>,
    pub similarity: Vec<String>,
    pub show_report: bool,
    pub skip_comparison: bool,
    pub log: LogContext,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            order: ExecutionOrder::default(),
            unsafe_mode: false,
            kernel: None,
            force_fail: false,
            notebook_timeout: DEFAULT_NOTEBOOK_TIMEOUT,
            normalizations: DEFAULT_NORMALIZATION.iter().map(|s| s.to_string()).collect(),
            similarity: DEFAULT_SIMILARITY.iter().map(|s| s.to_string()).collect(),
            show_report: false,
            skip_comparison: false,
            log: LogContext::default(),
        }
    }
}

/// Whether `run`/`compare` start from fresh results or keep accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Continuation {
    #[default]
    Reset,
    Continue,
}

/// Ends a run early. Caught only by [`Runner::run_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub fail: FailInfo,
    pub status: ExecutionStatus,
    pub exit_code: i32,
}

impl Stop {
    fn error(reason: &str, msg: impl Into<String>) -> Self {
        Stop {
            fail: FailInfo::new(reason, msg),
            status: ExecutionStatus::Error,
            exit_code: 1,
        }
    }

    fn skip(msg: &str) -> Self {
        Stop {
            fail: FailInfo::new(REASON_SKIP, msg),
            status: ExecutionStatus::Skipped,
            exit_code: 0,
        }
    }
}

enum Interruption {
    Finished,
    Timeout,
    Exception { reason: String, msg: String },
}

pub struct Runner {
    path: PathBuf,
    options: RunnerOptions,
    launcher: Box<dyn KernelLauncher>,
    engine: ComparisonEngine,
    notebook: Option<Notebook>,
    baseline: Option<Baseline>,
    report: NotebookReport,
}

impl Runner {
    pub fn new(path: impl Into<PathBuf>, options: RunnerOptions, launcher: Box<dyn KernelLauncher>) -> Self {
        Runner {
            path: path.into(),
            options,
            launcher,
            engine: ComparisonEngine::default(),
            notebook: None,
            baseline: None,
            report: NotebookReport::default(),
        }
    }

    pub fn with_engine(mut self, engine: ComparisonEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn report(&self) -> &NotebookReport {
        &self.report
    }

    pub fn into_report(self) -> NotebookReport {
        self.report
    }

    pub fn notebook(&self) -> Option<&Notebook> {
        self.notebook.as_ref()
    }

    pub fn run(&mut self) -> i32 {
        self.run_with(Continuation::Reset)
    }

    /// Runs every step and returns the process exit status.
    pub fn run_with(&mut self, continuation: Continuation) -> i32 {
        if continuation == Continuation::Reset {
            self.report = NotebookReport::default();
        }
        match self.try_run() {
            Ok(()) => {
                self.report.execution.status = ExecutionStatus::Run;
                0
            }
            Err(stop) => {
                info!("{} {}", self.options.log.prefix(), stop.fail.msg.as_deref().unwrap_or(""));
                self.report.fail = stop.fail;
                self.report.execution.status = stop.status;
                stop.exit_code
            }
        }
    }

    fn try_run(&mut self) -> std::result::Result<(), Stop> {
        self.load()?;
        let kernel = self.select_kernel()?;
        let selection = {
            let notebook = self.loaded()?;
            self.options.order.strategy().select_order(notebook)
        };
        self.report.execution.cell_order = selection.indices;
        if let Some(reason) = selection.skip_reason {
            info!("{} Skipping notebook. Reason: {}", self.options.log.prefix(), reason);
            return Err(Stop::skip(reason));
        }
        self.execute(&kernel)?;
        if !self.options.skip_comparison {
            self.compare(Continuation::Continue);
        }
        Ok(())
    }

    fn loaded(&self) -> std::result::Result<&Notebook, Stop> {
        self.notebook
            .as_ref()
            .ok_or_else(|| Stop::error(REASON_READ, "notebook not loaded"))
    }

    /// Reads the notebook and takes the baseline snapshot.
    pub fn load(&mut self) -> std::result::Result<(), Stop> {
        info!("{} Reading file {}", self.options.log.prefix(), self.path.display());
        match Notebook::load(&self.path) {
            Ok(notebook) => {
                self.baseline = Some(Baseline::snapshot(&notebook));
                self.notebook = Some(notebook);
                self.report.execution.mark(ExecutionFlag::Loaded);
                Ok(())
            }
            Err(err) => {
                debug!("{} Failed to open file", self.options.log.child().prefix());
                Err(Stop::error(REASON_READ, err.to_string()))
            }
        }
    }

    /// Requested kernel, then the declared one, then `python`, `python3`,
    /// then whatever is installed.
    pub fn select_kernel(&self) -> std::result::Result<String, Stop> {
        let log = self.options.log;
        let specs = self.launcher.kernel_specs().unwrap_or_else(|err| {
            warn!(error = %err, "could not list kernel specs");
            Vec::new()
        });
        let installed = |name: &str| specs.iter().any(|spec| spec == name);

        if let Some(requested) = &self.options.kernel {
            if installed(requested.as_str()) {
                info!("{} Using kernel {}", log.prefix(), requested);
                return Ok(requested.clone());
            }
            if self.options.force_fail {
                return Err(Stop::error(
                    REASON_NO_KERNEL,
                    format!("Kernel {} not found", requested),
                ));
            }
            info!(
                "{} Configured Kernel {} not found. Trying to detect other kernel",
                log.prefix(),
                requested
            );
        }

        let declared = self
            .notebook
            .as_ref()
            .and_then(Notebook::declared_kernel)
            .unwrap_or("python");
        let chosen = [declared, "python", "python3"]
            .into_iter()
            .find(|name| installed(*name))
            .map(str::to_string)
            .or_else(|| specs.first().cloned());
        match chosen {
            Some(kernel) => {
                info!("{} Using kernel {}", log.prefix(), kernel);
                Ok(kernel)
            }
            None => {
                info!("{} No kernel found", log.prefix());
                Err(Stop::error(REASON_NO_KERNEL, "Kernel not found"))
            }
        }
    }

    fn working_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Runs the selected cells. Timeouts and cell errors end execution but
    /// not the run; they only show up in the flags and `fail`.
    fn execute(&mut self, kernel_name: &str) -> std::result::Result<(), Stop> {
        let log = self.options.log;
        let timeout = self.options.notebook_timeout;
        let cwd = self.working_dir();
        let order = self.report.execution.cell_order.clone();
        let safety = safety_strategy(self.options.unsafe_mode);
        self.report.execution.mark(ExecutionFlag::Attempt);
        info!("{} Executing notebook", log.prefix());

        let started = Instant::now();
        let mut last_try = None;
        let interruption = match self.launcher.launch(kernel_name, &cwd) {
            Ok(mut kernel) => {
                let notebook = self
                    .notebook
                    .as_mut()
                    .ok_or_else(|| Stop::error(REASON_READ, "notebook not loaded"))?;
                let outcome = run_cells(
                    kernel.as_mut(),
                    notebook,
                    &order,
                    safety.as_ref(),
                    timeout,
                    started,
                    &mut last_try,
                );
                kernel.shutdown();
                outcome
            }
            Err(err) => Interruption::Exception {
                reason: REASON_RUNTIME.to_string(),
                msg: err.to_string(),
            },
        };

        let child = log.child();
        let execution = &mut self.report.execution;
        match interruption {
            Interruption::Finished => info!("{} Finished", child.prefix()),
            Interruption::Timeout => {
                info!("{} Timeout", child.prefix());
                execution.mark(ExecutionFlag::Timeout);
            }
            Interruption::Exception { reason, msg } => {
                info!("{} Exception: {}", child.prefix(), reason);
                execution.mark(ExecutionFlag::Exception);
                self.report.fail = FailInfo::new(reason, msg);
            }
        }
        debug!("{} Run up to {:?}", child.prefix(), last_try);
        execution.timeout = Some(timeout.as_secs_f64());
        execution.duration = Some(started.elapsed().as_secs_f64());
        execution.last_cell = last_try.map(|(_, index)| index);
        execution.executed_cells = last_try.map(|(position, _)| position + 1).unwrap_or(0);
        Ok(())
    }

    /// Compares the executed cells with the baseline. A cell that timed out
    /// is left out since it never finished.
    pub fn compare(&mut self, continuation: Continuation) {
        if continuation == Continuation::Reset {
            self.report.diff = DiffResult::default();
        }
        let (Some(baseline), Some(notebook)) = (self.baseline.as_ref(), self.notebook.as_ref()) else {
            return;
        };
        let log = self.options.log;
        info!("{} Comparing notebooks", log.prefix());
        let count = comparable_cells(&self.report.execution);
        let mut diff = Vec::new();
        let mut diffnorm = Vec::new();
        let mut similarities = Vec::new();
        for &index in self.report.execution.cell_order.iter().take(count) {
            let (Some(old), Some(new)) = (baseline.cell(index), notebook.cells.get(index)) else {
                continue;
            };
            debug!("{} Comparing cell {}", log.child().prefix(), index);
            let comparison = self.engine.compare_cell(
                index,
                old,
                new,
                &self.options.normalizations,
                &self.options.similarity,
            );
            if !comparison.original_equal {
                diff.push(index);
                if self.options.show_report {
                    self.show_report(&comparison);
                }
            }
            if !comparison.any_equal {
                diffnorm.push(index);
            }
            similarities.push(comparison.similarity_entry());
        }

        let child = log.child();
        let result = &mut self.report.diff;
        result.similarities.extend(similarities);
        if diff.is_empty() {
            info!("{} Identical results", child.prefix());
            result.mark(DiffFlag::SameResults);
        } else {
            info!("{} Diff on cells: {:?}", child.prefix(), diff);
            result.mark(DiffFlag::MismatchResults);
        }
        result.diff = join_indices(&diff);
        result.diff_count = diff.len();
        if diffnorm.is_empty() {
            info!("{} Identical results after normalizations", child.prefix());
            result.mark(DiffFlag::SameNorm);
        } else {
            info!("{} Diff on cells after normalizations: {:?}", child.prefix(), diffnorm);
            result.mark(DiffFlag::MismatchNorm);
        }
        result.diffnorm = join_indices(&diffnorm);
        result.diffnorm_count = diffnorm.len();
        result.mark(DiffFlag::Finished);
    }

    fn show_report(&self, comparison: &CellComparison) {
        let prefix = self.options.log.child().child().prefix();
        for line in comparison.summary_lines() {
            info!("{} {}", prefix, line);
        }
        let dir = self.working_dir();
        match write_mismatch_report(&dir, comparison) {
            Ok(files) => debug!(cell = comparison.index, files = files.len(), "mismatch report written"),
            Err(err) => warn!(cell = comparison.index, error = %err, "failed to write mismatch report"),
        }
    }

    /// Writes the re-executed notebook.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.notebook.as_ref().ok_or(Error::NotLoaded)?.save(path)
    }
}

fn join_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn comparable_cells(execution: &ExecutionResult) -> usize {
    let timed_out = usize::from(execution.has(ExecutionFlag::Timeout));
    execution.executed_cells.saturating_sub(timed_out)
}

/// Budget left for the next cell: what remains of the notebook timeout,
/// never less than a second.
pub fn cell_budget(notebook_timeout: Duration, elapsed: Duration) -> Duration {
    let elapsed_secs = elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0);
    let remaining = notebook_timeout.as_secs().saturating_sub(elapsed_secs);
    Duration::from_secs(remaining.max(1))
}

fn run_cells(
    kernel: &mut dyn Kernel,
    notebook: &mut Notebook,
    order: &[usize],
    safety: &dyn SafetyStrategy,
    timeout: Duration,
    started: Instant,
    last_try: &mut Option<(usize, usize)>,
) -> Interruption {
    let total = notebook.cells.len();
    for (position, &index) in order.iter().enumerate() {
        *last_try = Some((position, index));
        let Some(cell) = notebook.cells.get_mut(index) else {
            return Interruption::Exception {
                reason: REASON_MALFORMED.to_string(),
                msg: format!("cell {} is outside a notebook of {} cells", index, total),
            };
        };
        if !cell.is_code() || cell.source_text().trim().is_empty() {
            continue;
        }
        if safety.fix(cell) {
            warn!(cell = index, "removed destructive shell escape before running");
        }
        let budget = cell_budget(timeout, started.elapsed());
        debug!(cell = index, budget_secs = budget.as_secs(), "executing cell");
        match kernel.execute(&cell.source_text(), budget) {
            Ok(CellRun::Completed {
                outputs,
                execution_count,
            }) => {
                let failure = cell_error(&outputs);
                cell.set_outputs(outputs);
                cell.set_execution_count(execution_count);
                if let Some((reason, msg)) = failure {
                    return Interruption::Exception { reason, msg };
                }
            }
            Ok(CellRun::TimedOut { outputs }) => {
                cell.set_outputs(outputs);
                return Interruption::Timeout;
            }
            Err(err) => {
                return Interruption::Exception {
                    reason: REASON_RUNTIME.to_string(),
                    msg: err.to_string(),
                }
            }
        }
    }
    Interruption::Finished
}

fn ansi_escape() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static pattern"))
}

/// Reason and traceback of the first error output, if the cell raised.
fn cell_error(outputs: &[Value]) -> Option<(String, String)> {
    let error = outputs
        .iter()
        .find(|output| OutputKind::of(output) == OutputKind::Error)?;
    let traceback: Vec<String> = error
        .get("traceback")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(|line| ansi_escape().replace_all(line, "").into_owned())
                .collect()
        })
        .unwrap_or_default();
    let reason = error
        .get("ename")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| {
            traceback
                .iter()
                .flat_map(|entry| entry.lines())
                .filter_map(|line| line.split_once(": ").map(|(name, _)| name.trim()))
                .filter(|name| !name.is_empty())
                .last()
                .map(str::to_string)
        })
        .unwrap_or_else(|| REASON_UNKNOWN_EXCEPTION.to_string());
    let msg = if traceback.is_empty() {
        format!(
            "{}: {}",
            reason,
            error.get("evalue").and_then(Value::as_str).unwrap_or("")
        )
    } else {
        traceback.join("\n")
    };
    Some((reason, msg))
}
