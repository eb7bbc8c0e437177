//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data file written by an incompatible major version
    #[error("version mismatch: file major version {file}, ours {ours}")]
    VersionMismatch { file: u16, ours: u16 },

    /// Data file uses a different timestamp resolution than configured
    #[error("timestamp resolution in config differs from data file")]
    ResolutionMismatch,

    /// Compressed stream cannot be decoded
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    /// Config accessor without default found no value
    #[error("missing config key: {0}")]
    MissingKey(String),

    /// Config value could not be parsed
    #[error("invalid config value for {key}: {value}")]
    InvalidConfig { key: String, value: String },
}

impl EmberError {
    /// Setup-path errors that must abort opening the epoch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmberError::Io(_) | EmberError::VersionMismatch { .. } | EmberError::ResolutionMismatch
        )
    }

    /// Check if error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, EmberError::CorruptStream(_))
    }
}
