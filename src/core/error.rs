//! Error types for the core module.

use std::path::PathBuf;

/// Core error type.
///
/// Only raised for invalid caller input. Expected runtime
/// failures are reported through `RuntimeStatus` and `SpawnOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A source path that must be a directory is not.
    #[error("source path is not a directory: {}", .0.display())]
    InvalidSourcePath(PathBuf),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
