use super::{bash, provisioned, Lifecycle, Sandbox};
use crate::error::Result;
use crate::process::{CommandRunner, ProcessOutput};
use crate::shell::shell_quote;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Python virtual environment created by a user-supplied command, such as
/// `python3 -m venv` or `virtualenv`, which receives the env path last.
pub struct VenvSandbox {
    command: String,
    env: PathBuf,
    lifecycle: Lifecycle,
    runner: Arc<dyn CommandRunner>,
}

impl VenvSandbox {
    pub fn new(
        command: &str,
        env: impl Into<PathBuf>,
        lifecycle: Lifecycle,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        VenvSandbox {
            command: command.to_string(),
            env: env.into(),
            lifecycle,
            runner,
        }
    }

    fn delete(&self) {
        if !self.env.exists() {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.env) {
            warn!(env = %self.env.display(), error = %err, "failed to delete virtual environment");
        }
    }
}

#[async_trait]
impl Sandbox for VenvSandbox {
    async fn enter(&mut self) -> Result<ProcessOutput> {
        if !self.lifecycle.create {
            return Ok(ProcessOutput::succeeded());
        }
        self.delete();
        let create = bash(format!(
            "{} {}",
            self.command,
            shell_quote(&self.env.display().to_string())
        ));
        provisioned(self.runner.run(&create).await)
    }

    async fn exit(&mut self) {
        self.delete();
    }

    fn build_command(&self, cmd: &str) -> Vec<String> {
        let activate = self.env.join("bin").join("activate");
        bash(format!(
            "source {} && {}",
            shell_quote(&activate.display().to_string()),
            cmd
        ))
    }

    fn project_path(&self, host: &Path) -> PathBuf {
        host.to_path_buf()
    }

    fn report(&self) -> String {
        format!("VEnvironment: {}", self.env.display())
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::scripted::{exited, ScriptedRunner};

    #[tokio::test]
    async fn enter_recreates_and_exit_deletes() {
        let root = crate::testutil::scratch_dir("venv-cycle");
        let env = root.join("env");
        std::fs::create_dir_all(env.join("bin")).expect("stale env");
        let runner = Arc::new(ScriptedRunner::new());
        let mut sandbox = VenvSandbox::new("python3 -m venv", &env, Lifecycle::default(), runner.clone());

        sandbox.enter().await.expect("enter");
        assert!(!env.exists());
        assert_eq!(
            runner.calls()[0][2],
            format!("python3 -m venv {}", env.display())
        );

        std::fs::create_dir_all(&env).expect("created env");
        sandbox.exit().await;
        assert!(!env.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn explicit_exit_deletes_a_kept_env() {
        let root = crate::testutil::scratch_dir("venv-keep");
        let env = root.join("env");
        std::fs::create_dir_all(&env).expect("env");
        let runner = Arc::new(ScriptedRunner::new());
        let lifecycle = Lifecycle {
            create: true,
            remove: false,
        };
        let mut sandbox = VenvSandbox::new("python3 -m venv", &env, lifecycle, runner);
        assert_eq!(sandbox.report(), format!("VEnvironment: {}", env.display()));
        sandbox.exit().await;
        assert!(!env.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn paths_with_spaces_are_quoted() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut sandbox = VenvSandbox::new(
            "python3 -m venv",
            "/tmp/nbcheck never created/my env",
            Lifecycle::default(),
            runner.clone(),
        );
        sandbox.enter().await.expect("enter");
        assert_eq!(
            runner.calls()[0][2],
            "python3 -m venv '/tmp/nbcheck never created/my env'"
        );
        assert_eq!(
            sandbox.build_command("jupyter --version")[2],
            "source '/tmp/nbcheck never created/my env/bin/activate' && jupyter --version"
        );
    }

    #[tokio::test]
    async fn failed_create_is_prepare_error() {
        let runner = Arc::new(ScriptedRunner::new().on("virtualenv", exited(127, "", "virtualenv: not found")));
        let mut sandbox = VenvSandbox::new("virtualenv", "/tmp/nbcheck-never-created", Lifecycle::default(), runner);
        let err = sandbox.enter().await.expect_err("create fails");
        assert!(err.to_string().contains("not found"));
    }
}
