use std::io;
use thiserror::Error;

/// Central error type for the millrace engine.
#[derive(Debug, Error)]
pub enum MillError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A route pattern failed to compile.
    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The configured static base directory does not exist or is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(String),
}

pub type MillResult<T> = Result<T, MillError>;
