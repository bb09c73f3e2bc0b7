//! Subprocess execution with both output pipes drained concurrently.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::trace;

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Live view of subprocess output, called once per chunk read.
pub type Display = Arc<dyn Fn(StreamKind, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn succeeded() -> Self {
        ProcessOutput {
            code: Some(0),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Both streams in one message, for failure reports.
    pub fn combined(&self) -> String {
        format!(
            "##<>##\nOutput:\n{}\n##<>##Error:\n{}",
            self.stdout_text().trim(),
            self.stderr_text().trim()
        )
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> io::Result<ProcessOutput>;
}

#[derive(Clone, Default)]
pub struct TokioCommandRunner {
    display: Option<Display>,
}

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display(display: Display) -> Self {
        TokioCommandRunner {
            display: Some(display),
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin + Send>(
    mut reader: R,
    kind: StreamKind,
    display: Option<Display>,
) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Some(display) = &display {
            display(kind, &chunk[..n]);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

fn join_error(err: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, argv: &[String]) -> io::Result<ProcessOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        trace!(command = ?argv, "spawning");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout pipe not available"))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stderr pipe not available"))?;

        let stdout_handle = tokio::spawn(read_stream(stdout_pipe, StreamKind::Stdout, self.display.clone()));
        let stderr_handle = tokio::spawn(read_stream(stderr_pipe, StreamKind::Stderr, self.display.clone()));
        let (stdout, stderr) = tokio::join!(stdout_handle, stderr_handle);
        let stdout = stdout.map_err(join_error)??;
        let stderr = stderr.map_err(join_error)??;

        let status = child.wait().await?;
        Ok(ProcessOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}
