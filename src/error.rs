//! ClusterVol Error Types

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for ClusterVol operations
pub type Result<T> = std::result::Result<T, Error>;

/// ClusterVol error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Volume {name} is registered but its directory {} does not exist", path.display())]
    MissingDirectory { name: String, path: PathBuf },

    // Filesystem errors
    #[error("I/O failure on {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Resolver errors
    #[error("Mount/label query failed: {0}")]
    ExternalTool(String),

    // Registry errors
    #[error("Registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(
        "Registry {} changed concurrently (expected revision {expected}, found {found})",
        path.display()
    )]
    Conflict {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("Failed to lock {}: {reason}", path.display())]
    Lock { path: PathBuf, reason: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoFailure {
            path: path.into(),
            source,
        }
    }

    /// Check if this error means the label, volume or registry is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
