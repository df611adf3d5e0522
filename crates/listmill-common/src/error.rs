//! Error types for listmill

use thiserror::Error;

/// Main error type for listmill
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Messenger error: {0}")]
    Messenger(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Bounce processing error: {0}")]
    Bounce(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for listmill
pub type Result<T> = std::result::Result<T, Error>;
