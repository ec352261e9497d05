use thiserror::Error;

use crate::policy::Tier;

/// Result type for admission operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors that can occur while admitting a request.
///
/// A rate-limit denial is not an error: it is reported through
/// [`Decision::allowed`](crate::service::Decision).
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// A required identity field was empty. Never recovered by falling back
    /// to a shared identity.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tier is not metered: {0}")]
    TierNotMetered(Tier),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),
}
