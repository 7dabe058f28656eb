//! Error types for the CLI.

use std::path::PathBuf;

use keel_common::telemetry::TelemetryError;

/// CLI Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Keel(#[from] keel_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("cannot read cluster file {path}: {message}")]
    ClusterFile { path: PathBuf, message: String },

    #[error("cluster not found: {name}")]
    ClusterNotFound { name: String },
}
