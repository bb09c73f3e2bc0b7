//! Manifest discovery and dependency installation inside a sandbox.

use crate::error::{Error, Result};
use crate::process::ProcessOutput;
use crate::sandbox::Sandbox;
use crate::shell::single_quote;
use nbcheck_core::LogContext;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Placeholder in a path list that expands to every matching file.
pub const DISCOVER: &str = "<discover>";

/// File `extract-pipenv` writes next to the Pipfile it converts.
pub const PIPENV_REQUIREMENTS: &str = "_nbcheck_requirements.txt";

const CHECKPOINTS: &str = ".ipynb_checkpoints";

/// Declaration files, ordered by install priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestKind {
    SetupPy,
    Requirements,
    Pipfile,
    PipfileLock,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 4] = [
        ManifestKind::SetupPy,
        ManifestKind::Requirements,
        ManifestKind::Pipfile,
        ManifestKind::PipfileLock,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ManifestKind::SetupPy => "setup.py",
            ManifestKind::Requirements => "requirements.txt",
            ManifestKind::Pipfile => "Pipfile",
            ManifestKind::PipfileLock => "Pipfile.lock",
        }
    }
}

/// Manifest paths per kind, relative to the project directory.
pub type InstallSpec = BTreeMap<ManifestKind, Vec<String>>;

/// Replaces the [`DISCOVER`] marker in `values` with the files under `root`
/// accepted by `matches`, keeping explicit entries around it in place.
fn discover_files(
    root: &Path,
    values: &[String],
    matches: impl Fn(&Path) -> bool,
    exclude: Option<&str>,
) -> Result<Vec<String>> {
    let Some(index) = values.iter().position(|v| v == DISCOVER) else {
        return Ok(values.to_vec());
    };
    let mut found = Vec::new();
    let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
        exclude.map_or(true, |ex| e.file_name() != ex)
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || !matches(entry.path()) {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let name = rel.to_string_lossy().into_owned();
        if !values.contains(&name) && !found.contains(&name) {
            found.push(name);
        }
    }
    let mut out: Vec<String> = values[..index].to_vec();
    out.extend(found);
    out.extend(values[index + 1..].iter().filter(|v| *v != DISCOVER).cloned());
    Ok(out)
}

pub fn discover_manifests(root: &Path, kind: ManifestKind, values: &[String]) -> Result<Vec<String>> {
    let file_name = kind.file_name();
    discover_files(
        root,
        values,
        |path| path.file_name().map_or(false, |n| n == file_name),
        None,
    )
}

/// Notebooks under `root`, never descending into checkpoint directories.
pub fn discover_notebooks(root: &Path, values: &[String]) -> Result<Vec<String>> {
    discover_files(
        root,
        values,
        |path| path.extension().map_or(false, |ext| ext == "ipynb"),
        Some(CHECKPOINTS),
    )
}

pub fn discover_spec(root: &Path, requested: &BTreeMap<ManifestKind, Vec<String>>) -> Result<InstallSpec> {
    let mut spec = InstallSpec::new();
    for (kind, values) in requested {
        spec.insert(*kind, discover_manifests(root, *kind, values)?);
    }
    Ok(spec)
}

fn pip(args: &str) -> String {
    format!("GIT_TERMINAL_PROMPT=0 pip install --progress-bar off {}", args)
}

/// Runs installers for one sandbox, in priority order, stopping at the first
/// manifest that fails.
pub struct Installer<'a> {
    sandbox: &'a dyn Sandbox,
    project: PathBuf,
    tool: String,
    tool_install: Option<String>,
    log: LogContext,
}

impl<'a> Installer<'a> {
    pub fn new(sandbox: &'a dyn Sandbox, host_project: &Path, tool: &str, log: LogContext) -> Self {
        Installer {
            sandbox,
            project: sandbox.project_path(host_project),
            tool: tool.to_string(),
            tool_install: None,
            log,
        }
    }

    /// Shell command that installs this tool into the sandbox before any
    /// manifest.
    pub fn with_tool_install(mut self, command: Option<String>) -> Self {
        self.tool_install = command;
        self
    }

    /// Returns the labels of the steps that succeeded.
    pub async fn install(&self, spec: &InstallSpec) -> Result<Vec<String>> {
        let mut ok: Vec<String> = Vec::new();
        if let Some(command) = &self.tool_install {
            info!("{} Installing {}", self.log.child().prefix(), self.tool);
            if let Err(data) = self.step(command.clone()).await {
                return Err(install_failure(&ok, &self.tool, &data));
            }
            ok.push(self.tool.clone());
        }
        for (kind, names) in spec {
            if let Err(data) = self.install_kind(*kind, names).await {
                return Err(install_failure(&ok, kind.file_name(), &data));
            }
            ok.push(kind.file_name().to_string());
        }
        Ok(ok)
    }

    async fn install_kind(&self, kind: ManifestKind, names: &[String]) -> std::result::Result<(), String> {
        let prefix = self.log.child().prefix();
        for name in names.iter().filter(|n| !n.is_empty()) {
            let path = self.project.join(name);
            match kind {
                ManifestKind::SetupPy => {
                    let dir = path.parent().unwrap_or(self.project.as_path());
                    info!("{} Installing setup {}", prefix, dir.display());
                    self.step(pip(&format!("-e {}", quoted(dir)))).await?;
                }
                ManifestKind::Requirements => {
                    info!("{} Installing requirements {}", prefix, path.display());
                    self.step(pip(&format!("-r {}", quoted(&path)))).await?;
                }
                ManifestKind::Pipfile | ManifestKind::PipfileLock => {
                    info!("{} Converting to requirements: {}", prefix, path.display());
                    self.step(format!(
                        "{} extract-pipenv -p {} -o {}",
                        self.tool,
                        quoted(&path),
                        single_quote(PIPENV_REQUIREMENTS)
                    ))
                    .await?;
                    let requirements = path.parent().unwrap_or(self.project.as_path()).join(PIPENV_REQUIREMENTS);
                    info!("{} Installing requirements {}", prefix, requirements.display());
                    self.step(pip(&format!("-r {}", quoted(&requirements)))).await?;
                }
            }
        }
        Ok(())
    }

    async fn step(&self, command: String) -> std::result::Result<ProcessOutput, String> {
        debug!(command = %command, "install step");
        match self.sandbox.run(&command).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(output.combined()),
            Err(err) => Err(ProcessOutput {
                code: None,
                stdout: Vec::new(),
                stderr: err.to_string().into_bytes(),
            }
            .combined()),
        }
    }
}

fn quoted(path: &Path) -> String {
    single_quote(&path.display().to_string())
}

fn install_failure(ok: &[String], failed: &str, data: &str) -> Error {
    Error::Install(format!(
        "Ok: {}\n##<<>>##Failed: {}\n##<<>>##{}:\n{}",
        ok.join(", "),
        failed,
        failed,
        data
    ))
}
