use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failures that happen before any guest code runs.
///
/// Everything that goes wrong *inside* an execution (runtime errors, timeouts,
/// limit violations) is reported through `ExecutionResult` instead.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("Working directory does not exist: {0}")]
    WorkingDirectoryMissing(PathBuf),

    #[error("Working directory is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Working directory is not writable: {0}")]
    WorkingDirectoryReadOnly(PathBuf),

    #[error("Failed to scan working directory {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn execution process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}
