use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read notebook {path}: {source}")]
    NotebookRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse notebook {path}: {source}")]
    NotebookParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no notebook loaded")]
    NotLoaded,

    #[error("no kernel found: {0}")]
    NoKernelFound(String),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the kernel process itself, as opposed to errors raised by cell code.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("failed to start kernel {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel protocol error: {0}")]
    Protocol(String),

    #[error("kernel died: {0}")]
    Died(String),
}
