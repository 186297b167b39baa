//! Error types for cloudraid

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloudraid
#[derive(Error, Debug)]
pub enum Error {
    // Erasure coding errors
    #[error("Invalid coding configuration: {0}")]
    CodingConfiguration(String),

    #[error("Reconstruction failed: only {available} of {required} fragments available")]
    ReconstructionFailure { available: usize, required: usize },

    #[error("Erasure encoding failed: {0}")]
    Encode(String),

    #[error("Erasure decoding failed: {0}")]
    Decode(String),

    // Backend errors
    #[error("Backend {backend} failed: {message}")]
    Backend { backend: String, message: String },

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend {0} unavailable")]
    BackendUnavailable(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Not enough space: need {needed} bytes, {available} available")]
    InsufficientCapacity { needed: u64, available: u64 },

    // Orchestration errors
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Upload incomplete: only {placed} fragments placed, need {required}")]
    UploadIncomplete { placed: usize, required: usize },

    #[error("Checksum mismatch for slice {slice}: expected {expected}, got {got}")]
    ChecksumMismatch {
        slice: String,
        expected: String,
        got: String,
    },

    // Metadata errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a per-fragment backend failure
    pub fn backend(backend: impl Into<String>, message: impl ToString) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether the same operation could succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Backend { .. }
                | Error::BackendUnavailable(_)
                | Error::Io(_)
                | Error::ChecksumMismatch { .. }
                | Error::UploadIncomplete { .. }
        )
    }

    /// Whether this error means the object (or a blob) does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound(_) | Error::BlobNotFound(_))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
