use super::{bash, provisioned, succeeded, Lifecycle, Sandbox};
use crate::error::Result;
use crate::process::{CommandRunner, ProcessOutput};
use crate::shell::single_quote;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Named conda environment under an existing conda installation.
pub struct CondaSandbox {
    name: String,
    operation: String,
    conda_root: PathBuf,
    lifecycle: Lifecycle,
    runner: Arc<dyn CommandRunner>,
}

impl CondaSandbox {
    /// `operation` is appended to `conda create`, e.g. `python=3.8 jupyter`.
    pub fn new(
        name: &str,
        operation: &str,
        conda_root: &Path,
        lifecycle: Lifecycle,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        CondaSandbox {
            name: name.to_string(),
            operation: operation.to_string(),
            conda_root: conda_root.to_path_buf(),
            lifecycle,
            runner,
        }
    }

    fn env_dir(&self) -> PathBuf {
        self.conda_root.join("envs").join(&self.name)
    }

    fn profile(&self) -> String {
        format!(
            ". {}",
            single_quote(&self.conda_root.join("etc/profile.d/conda.sh").display().to_string())
        )
    }

    fn conda(&self, args: &str) -> Vec<String> {
        bash(format!("{} && conda {}", self.profile(), args))
    }

    /// Removes the environment, deleting its directory if conda refuses.
    async fn remove_env(&self) {
        let removed = self
            .runner
            .run(&self.conda(&format!("env remove --name {} -y", single_quote(&self.name))))
            .await;
        let dir = self.env_dir();
        if !succeeded(&removed) {
            debug!(env = %self.name, "conda env remove failed");
        }
        if dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!(env = %self.name, error = %err, "failed to delete conda env directory");
            }
        }
    }
}

#[async_trait]
impl Sandbox for CondaSandbox {
    async fn enter(&mut self) -> Result<ProcessOutput> {
        if !self.lifecycle.create {
            return Ok(ProcessOutput::succeeded());
        }
        self.remove_env().await;
        let create = format!(
            "create -y --name {} {}",
            single_quote(&self.name),
            self.operation
        );
        provisioned(self.runner.run(&self.conda(&create)).await)
    }

    async fn exit(&mut self) {
        self.remove_env().await;
    }

    fn build_command(&self, cmd: &str) -> Vec<String> {
        bash(format!(
            "{} && conda activate {} && {}",
            self.profile(),
            single_quote(&self.name),
            cmd
        ))
    }

    fn project_path(&self, host: &Path) -> PathBuf {
        host.to_path_buf()
    }

    fn report(&self) -> String {
        format!("Conda env: {}", self.name)
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

    fn conda(runner: Arc<ScriptedRunner>, root: &Path) -> CondaSandbox {
        CondaSandbox::new("nb-env", "python=3.8 jupyter", root, Lifecycle::default(), runner)
    }

    #[tokio::test]
    async fn enter_removes_stale_env_before_create() {
        let root = crate::testutil::scratch_dir("conda-enter");
        std::fs::create_dir_all(root.join("envs/nb-env")).expect("stale env");
        let runner = Arc::new(ScriptedRunner::new().on("env remove", exited(1, "", "not found")));
        let mut sandbox = conda(runner.clone(), &root);
        sandbox.enter().await.expect("enter");

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][2].ends_with("conda env remove --name 'nb-env' -y"));
        assert!(calls[1][2].ends_with("conda create -y --name 'nb-env' python=3.8 jupyter"));
        assert!(!root.join("envs/nb-env").exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_create_reports_stderr() {
        let root = crate::testutil::scratch_dir("conda-fail");
        let runner = Arc::new(ScriptedRunner::new().on("conda create", exited(1, "", "PackagesNotFoundError")));
        let mut sandbox = conda(runner, &root);
        let err = sandbox.enter().await.expect_err("create fails");
        assert!(err.to_string().contains("PackagesNotFoundError"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn commands_activate_the_env() {
        let runner = Arc::new(ScriptedRunner::new());
        let sandbox = conda(runner, Path::new("/opt/conda"));
        let argv = sandbox.build_command("jupyter --version");
        assert_eq!(argv[0], "/bin/bash");
        assert_eq!(
            argv[2],
            ". '/opt/conda/etc/profile.d/conda.sh' && conda activate 'nb-env' && jupyter --version"
        );
        assert_eq!(sandbox.report(), "Conda env: nb-env");
        assert_eq!(sandbox.project_path(Path::new("/p")), PathBuf::from("/p"));
    }

    #[tokio::test]
    async fn exit_removes_a_kept_env() {
        let root = crate::testutil::scratch_dir("conda-exit");
        std::fs::create_dir_all(root.join("envs/nb-env")).expect("env dir");
        let runner = Arc::new(ScriptedRunner::new().on("env remove", exited(1, "", "busy")));
        let lifecycle = Lifecycle {
            create: true,
            remove: false,
        };
        let mut sandbox = CondaSandbox::new("nb-env", "python=3.8", &root, lifecycle, runner.clone());
        sandbox.exit().await;
        assert_eq!(runner.count("env remove --name 'nb-env'"), 1);
        assert!(!root.join("envs/nb-env").exists(), "directory deleted when conda refuses");
        let _ = std::fs::remove_dir_all(&root);
    }
}
