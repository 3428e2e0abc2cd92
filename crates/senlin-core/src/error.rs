use thiserror::Error;

/// Top-level error type for the Senlin action engine.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for SenlinError` so that the `?` operator works
/// across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SenlinError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for SenlinError {
    fn from(err: toml::de::Error) -> Self {
        SenlinError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SenlinError {
    fn from(err: toml::ser::Error) -> Self {
        SenlinError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SenlinError {
    fn from(err: serde_json::Error) -> Self {
        SenlinError::Serialization(err.to_string())
    }
}

impl From<crate::store::StoreError> for SenlinError {
    fn from(err: crate::store::StoreError) -> Self {
        SenlinError::Storage(err.to_string())
    }
}

/// A specialized `Result` type for Senlin operations.
pub type Result<T> = std::result::Result<T, SenlinError>;
