//! Disposable execution targets.
//!
//! A sandbox is entered once, receives commands through [`Sandbox::run`] and
//! is torn down by [`Sandbox::exit`]. `create=false` reuses an existing
//! target. `remove=false` only tells the orchestrator not to call `exit`
//! after a batch; whoever keeps the sandbox calls it later.

mod conda;
mod docker;
mod venv;

pub use conda::CondaSandbox;
pub use docker::{DockerSandbox, DEFAULT_WORKDIR};
pub use venv::VenvSandbox;

use crate::error::{Error, Result};
use crate::process::{CommandRunner, ProcessOutput};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub create: bool,
    pub remove: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle {
            create: true,
            remove: true,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provisions the target. On failure the error carries the diagnostic
    /// output of the command that failed.
    async fn enter(&mut self) -> Result<ProcessOutput>;

    /// Tears the target down. Callers decide when, based on [`Lifecycle::remove`].
    async fn exit(&mut self);

    /// Wraps a shell command so that it runs inside the sandbox.
    fn build_command(&self, cmd: &str) -> Vec<String>;

    /// Where a host project directory is visible from inside the sandbox.
    fn project_path(&self, host: &Path) -> PathBuf;

    fn report(&self) -> String;

    fn lifecycle(&self) -> Lifecycle;

    fn runner(&self) -> &dyn CommandRunner;

    async fn run(&self, cmd: &str) -> io::Result<ProcessOutput> {
        self.runner().run(&self.build_command(cmd)).await
    }
}

fn bash(script: String) -> Vec<String> {
    vec!["/bin/bash".to_string(), "-c".to_string(), script]
}

/// Turns a provisioning command result into the enter outcome.
fn provisioned(result: io::Result<ProcessOutput>) -> Result<ProcessOutput> {
    match result {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(Error::PrepareEnvironment {
            code: output.code,
            message: output.stderr_text(),
        }),
        Err(err) => Err(Error::PrepareEnvironment {
            code: None,
            message: err.to_string(),
        }),
    }
}

fn succeeded(result: &io::Result<ProcessOutput>) -> bool {
    matches!(result, Ok(output) if output.success())
}
