//! Sandboxed batch execution: provision an environment, install the
//! project's dependencies and run each notebook through `nbcheck run`.

pub mod error;
pub mod install;
pub mod orchestrator;
pub mod process;
pub mod sandbox;
pub mod shell;
pub mod summary;

pub use error::{Error, Result};
pub use install::{discover_notebooks, discover_spec, InstallSpec, Installer, ManifestKind, DISCOVER};
pub use orchestrator::{BatchOutcome, Orchestrator, OrchestratorOptions};
pub use process::{CommandRunner, Display, ProcessOutput, StreamKind, TokioCommandRunner};
pub use sandbox::{CondaSandbox, DockerSandbox, Lifecycle, Sandbox, VenvSandbox};
pub use summary::{exit_code, BatchSummary};
