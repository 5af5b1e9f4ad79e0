//! Error types for poncos

use thiserror::Error;

/// Main error type for poncos
#[derive(Error, Debug)]
pub enum PoncosError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend error (provisioning, launching, pausing, migrating)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Agent communication error
    #[error("Network error: {0}")]
    Network(String),

    /// Bandwidth probe error
    #[error("Probe error: {0}")]
    Probe(String),

    /// A remote round-trip did not complete within its deadline
    #[error("Timeout after {secs}s waiting for {operation}")]
    Timeout { operation: String, secs: u64 },

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Job cannot be run on this grid
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Operation not offered by the selected backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoncosError {
    /// Whether the failure is transient and the operation may be attempted again later.
    ///
    /// The scheduler keeps going after a recoverable error and falls back to
    /// the freeze/wait branch of the rebalancing loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoncosError::Timeout { .. }
                | PoncosError::Network(_)
                | PoncosError::Probe(_)
                | PoncosError::Runtime(_)
        )
    }
}

/// Result type for poncos operations
pub type PoncosResult<T> = Result<T, PoncosError>;

impl From<serde_json::Error> for PoncosError {
    fn from(err: serde_json::Error) -> Self {
        PoncosError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PoncosError {
    fn from(err: toml::de::Error) -> Self {
        PoncosError::Config(err.to_string())
    }
}
