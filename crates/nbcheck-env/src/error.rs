use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to prepare environment: {message}")]
    PrepareEnvironment { code: Option<i32>, message: String },

    #[error("failed to install dependencies: {0}")]
    Install(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Core(#[from] nbcheck_core::Error),
}
