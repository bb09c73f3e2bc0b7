use super::{provisioned, succeeded, Lifecycle, Sandbox};
use crate::error::Result;
use crate::process::{CommandRunner, ProcessOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_WORKDIR: &str = "/home/nbcheck/execution";

/// Detached container with the project bind-mounted at `workdir`.
pub struct DockerSandbox {
    image: String,
    workdir: String,
    volumes: Vec<(PathBuf, String)>,
    prelude: Vec<String>,
    container_id: Option<String>,
    lifecycle: Lifecycle,
    runner: Arc<dyn CommandRunner>,
}

impl DockerSandbox {
    /// With `create=false`, `image` names the already running container.
    pub fn new(
        image: &str,
        project: &Path,
        workdir: &str,
        lifecycle: Lifecycle,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        DockerSandbox {
            image: image.to_string(),
            workdir: workdir.to_string(),
            volumes: vec![(project.to_path_buf(), workdir.to_string())],
            prelude: Vec::new(),
            container_id: if lifecycle.create {
                None
            } else {
                Some(image.to_string())
            },
            lifecycle,
            runner,
        }
    }

    pub fn with_volume(mut self, host: &Path, target: &str) -> Self {
        self.volumes.push((host.to_path_buf(), target.to_string()));
        self
    }

    /// Commands chained before every command run in the container.
    pub fn with_prelude(mut self, prelude: Vec<String>) -> Self {
        self.prelude = prelude;
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    fn start_command(&self) -> Vec<String> {
        let mut args: Vec<String> = ["docker", "run", "-it", "-d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (source, target) in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", source.display(), target));
        }
        args.push(self.image.clone());
        args.push("/bin/bash".to_string());
        args
    }

    fn container_command(&self, verb: &[&str], id: &str) -> Vec<String> {
        let mut args = vec!["docker".to_string(), "container".to_string()];
        args.extend(verb.iter().map(|s| s.to_string()));
        args.push(id.to_string());
        args
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn enter(&mut self) -> Result<ProcessOutput> {
        if !self.lifecycle.create {
            return Ok(ProcessOutput::succeeded());
        }
        let output = provisioned(self.runner.run(&self.start_command()).await)?;
        let id = output.stdout_text().trim().to_string();
        debug!(container = %id, "container started");
        self.container_id = Some(id);
        Ok(output)
    }

    async fn exit(&mut self) {
        let Some(id) = self.container_id.clone() else {
            return;
        };
        let killed = self.runner.run(&self.container_command(&["kill"], &id)).await;
        let removed = if succeeded(&killed) {
            let removed = self.runner.run(&self.container_command(&["rm", "-f"], &id)).await;
            succeeded(&removed)
        } else {
            warn!(container = %id, "failed to kill container");
            false
        };
        if !removed {
            warn!(container = %id, "failed to remove container, pruning");
            let pruned = self
                .runner
                .run(&["docker", "container", "prune", "-f"].map(String::from))
                .await;
            if !succeeded(&pruned) {
                warn!(container = %id, "failed to prune containers");
            }
        }
    }

    fn build_command(&self, cmd: &str) -> Vec<String> {
        let mut chain = self.prelude.clone();
        chain.push(cmd.to_string());
        vec![
            "docker".to_string(),
            "exec".to_string(),
            "-t".to_string(),
            self.container_id.clone().unwrap_or_default(),
            "/bin/bash".to_string(),
            "-c".to_string(),
            chain.join(" && "),
        ]
    }

    fn project_path(&self, _host: &Path) -> PathBuf {
        PathBuf::from(&self.workdir)
    }

    fn report(&self) -> String {
        format!(
            "Docker container: {}",
            self.container_id.as_deref().unwrap_or("<none>")
        )
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }
}
