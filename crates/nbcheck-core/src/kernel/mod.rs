//! Kernel seam: what the runner needs from an interpreter.
//!
//! The production launcher drives Jupyter kernels through a small Python
//! bridge speaking line-delimited JSON on stdin/stdout.

use crate::error::KernelError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;
use tracing::debug;

const BRIDGE: &str = include_str!("bridge.py");

#[derive(Debug, Clone, PartialEq)]
pub enum CellRun {
    Completed {
        outputs: Vec<Value>,
        execution_count: Option<i64>,
    },
    /// The kernel was interrupted at the deadline; outputs are whatever
    /// arrived before that.
    TimedOut { outputs: Vec<Value> },
}

pub trait Kernel {
    fn execute(&mut self, source: &str, timeout: Duration) -> Result<CellRun, KernelError>;
    fn shutdown(&mut self);
}

pub trait KernelLauncher {
    /// Names of the installed kernel specs.
    fn kernel_specs(&self) -> Result<Vec<String>, KernelError>;
    fn launch(&self, name: &str, cwd: &Path) -> Result<Box<dyn Kernel>, KernelError>;
}

#[derive(Debug, Clone)]
pub struct JupyterLauncher {
    pub jupyter: String,
    pub python: String,
}

impl Default for JupyterLauncher {
    fn default() -> Self {
        JupyterLauncher {
            jupyter: "jupyter".to_string(),
            python: "python3".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct KernelSpecList {
    #[serde(default)]
    kernelspecs: serde_json::Map<String, Value>,
}

impl KernelLauncher for JupyterLauncher {
    fn kernel_specs(&self) -> Result<Vec<String>, KernelError> {
        let output = Command::new(&self.jupyter)
            .args(["kernelspec", "list", "--json"])
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| KernelError::Spawn {
                name: self.jupyter.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(KernelError::Protocol(format!(
                "kernelspec list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let list: KernelSpecList = serde_json::from_slice(&output.stdout)
            .map_err(|e| KernelError::Protocol(format!("kernelspec list: {}", e)))?;
        Ok(list.kernelspecs.keys().cloned().collect())
    }

    fn launch(&self, name: &str, cwd: &Path) -> Result<Box<dyn Kernel>, KernelError> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c").arg(BRIDGE).arg(name);
        cmd.current_dir(cwd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|source| KernelError::Spawn {
            name: name.to_string(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(KernelError::Protocol("bridge pipes unavailable".into()));
        };
        let mut kernel = BridgeKernel {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            closed: false,
        };
        let ready = kernel.read_reply()?;
        if ready.status != "ready" {
            kernel.shutdown();
            return Err(KernelError::Died(
                ready.message.unwrap_or_else(|| "kernel failed to start".into()),
            ));
        }
        debug!(kernel = name, "kernel started");
        Ok(Box::new(kernel))
    }
}

#[derive(Deserialize)]
struct BridgeReply {
    status: String,
    #[serde(default)]
    outputs: Vec<Value>,
    #[serde(default)]
    execution_count: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

struct BridgeKernel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    closed: bool,
}

impl BridgeKernel {
    fn send(&mut self, request: &Value) -> Result<(), KernelError> {
        let line = format!("{}\n", request);
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| KernelError::Died(format!("bridge stdin closed: {}", e)))
    }

    fn read_reply(&mut self) -> Result<BridgeReply, KernelError> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| KernelError::Protocol(e.to_string()))?;
        if read == 0 {
            return Err(KernelError::Died("bridge exited".into()));
        }
        serde_json::from_str(line.trim())
            .map_err(|e| KernelError::Protocol(format!("bad bridge reply: {}", e)))
    }
}

impl Kernel for BridgeKernel {
    fn execute(&mut self, source: &str, timeout: Duration) -> Result<CellRun, KernelError> {
        self.send(&json!({"source": source, "timeout": timeout.as_secs_f64()}))?;
        let reply = self.read_reply()?;
        match reply.status.as_str() {
            "ok" => Ok(CellRun::Completed {
                outputs: reply.outputs,
                execution_count: reply.execution_count,
            }),
            "timeout" => Ok(CellRun::TimedOut {
                outputs: reply.outputs,
            }),
            _ => Err(KernelError::Died(
                reply.message.unwrap_or_else(|| reply.status.clone()),
            )),
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.send(&json!({"shutdown": true}));
        if self.child.wait().is_err() {
            let _ = self.child.kill();
        }
    }
}

impl Drop for BridgeKernel {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Scripted kernels for runner tests.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub type Step = Result<CellRun, KernelError>;

    #[derive(Default)]
    pub struct Log {
        pub sources: Vec<String>,
        pub budgets: Vec<Duration>,
        pub shutdowns: usize,
    }

    pub struct ScriptedLauncher {
        pub specs: Vec<String>,
        pub steps: Mutex<VecDeque<Step>>,
        pub log: Arc<Mutex<Log>>,
        pub launched: Mutex<Vec<String>>,
    }

    impl ScriptedLauncher {
        pub fn new(specs: &[&str], steps: Vec<Step>) -> Self {
            ScriptedLauncher {
                specs: specs.iter().map(|s| s.to_string()).collect(),
                steps: Mutex::new(steps.into()),
                log: Arc::new(Mutex::new(Log::default())),
                launched: Mutex::new(Vec::new()),
            }
        }
    }

    struct ScriptedKernel {
        steps: VecDeque<Step>,
        log: Arc<Mutex<Log>>,
    }

    impl Kernel for ScriptedKernel {
        fn execute(&mut self, source: &str, timeout: Duration) -> Result<CellRun, KernelError> {
            let mut log = self.log.lock().expect("log");
            log.sources.push(source.to_string());
            log.budgets.push(timeout);
            self.steps.pop_front().unwrap_or(Ok(CellRun::Completed {
                outputs: vec![],
                execution_count: None,
            }))
        }

        fn shutdown(&mut self) {
            self.log.lock().expect("log").shutdowns += 1;
        }
    }

    impl KernelLauncher for ScriptedLauncher {
        fn kernel_specs(&self) -> Result<Vec<String>, KernelError> {
            Ok(self.specs.clone())
        }

        fn launch(&self, name: &str, _cwd: &Path) -> Result<Box<dyn Kernel>, KernelError> {
            self.launched.lock().expect("launched").push(name.to_string());
            let steps = std::mem::take(&mut *self.steps.lock().expect("steps"));
            Ok(Box::new(ScriptedKernel {
                steps,
                log: Arc::clone(&self.log),
            }))
        }
    }

    pub fn completed(outputs: Vec<Value>, count: i64) -> Step {
        Ok(CellRun::Completed {
            outputs,
            execution_count: Some(count),
        })
    }
}
