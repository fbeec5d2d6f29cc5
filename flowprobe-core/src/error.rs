//! Error types for flowprobe

use thiserror::Error;

/// Result type alias for flowprobe operations
pub type Result<T> = std::result::Result<T, ProbeError>;

/// flowprobe error types
#[derive(Error, Debug)]
pub enum ProbeError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Block data does not match its metadata
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// A column file was opened for reading without its sidecar header
    #[error("missing header file: {0}")]
    MissingHeader(String),

    /// File opened in the wrong access mode
    #[error("invalid file access: {0}")]
    Access(String),

    /// Sidecar header could not be persisted after a data append
    #[error("header write failed: {0}")]
    HeaderWrite(String),

    /// Compression/decompression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid data format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Condition string could not be parsed
    #[error("malformed condition: {0}")]
    MalformedCondition(String),

    /// Query arguments failed validation
    #[error("invalid query: {0}")]
    Query(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture source error
    #[error("capture error: {0}")]
    Capture(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl ProbeError {
    /// Check if error is retryable (on the write path: retry next interval)
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Io(_))
    }

    /// Check if error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ProbeError::CorruptBlock(_) | ProbeError::MissingHeader(_)
        )
    }

    /// Check if error must take down the owning interface (the on-disk index
    /// would otherwise silently diverge from the data)
    pub fn is_fatal_for_interface(&self) -> bool {
        matches!(self, ProbeError::HeaderWrite(_))
    }
}
