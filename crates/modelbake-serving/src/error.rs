//! Error types for modelbake-serving

use thiserror::Error;

/// Errors returned by the serving client
#[derive(Error, Debug)]
pub enum ServingError {
    /// Endpoint URL could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Request could not be sent or the body could not be read
    #[error("HTTP transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    /// Response body did not have the expected shape
    #[error("unexpected response from {path}: {message}")]
    Decode { path: String, message: String },

    /// Validation found the response unusable
    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<reqwest::Error> for ServingError {
    fn from(err: reqwest::Error) -> Self {
        ServingError::Transport(err.to_string())
    }
}

/// Result type for serving operations
pub type ServingResult<T> = std::result::Result<T, ServingError>;
