//! Notebook re-execution and output comparison.

pub mod compare;
pub mod error;
pub mod fsutil;
pub mod kernel;
pub mod log;
pub mod notebook;
pub mod order;
pub mod results;
pub mod runner;

pub use compare::normalizers::{Stage, StageRegistry};
pub use compare::{CellComparison, ComparisonEngine, DEFAULT_NORMALIZATION, DEFAULT_SIMILARITY};
pub use error::{Error, KernelError, Result};
pub use kernel::{CellRun, JupyterLauncher, Kernel, KernelLauncher};
pub use log::LogContext;
pub use notebook::{Baseline, Cell, CellType, Notebook, OutputKind};
pub use order::{ExecutionOrder, OrderSelection, OrderStrategy, SafetyStrategy};
pub use results::{
    DiffFlag, DiffReason, DiffResult, ExecutionFlag, ExecutionResult, ExecutionStatus, FailInfo,
    NormalizerRecord, NotebookReport, RESULT_SEPARATOR,
};
pub use runner::{Continuation, Runner, RunnerOptions, Stop};
