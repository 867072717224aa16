//! Error types for modelbake-session

use thiserror::Error;

/// Errors that can occur while driving a container session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Image is not present in the image store (and could not be pulled)
    #[error("image not found: {image}: {message}")]
    ImagePull { image: String, message: String },

    /// Container could not be started for a reason other than a missing image
    #[error("failed to start container from {image}: {message}")]
    StartFailed { image: String, message: String },

    /// Serving endpoint never became reachable
    #[error("container {id} not ready after {timeout_secs}s at {endpoint}")]
    StartupTimeout {
        id: String,
        endpoint: String,
        timeout_secs: u64,
    },

    /// Operation requires a running session
    #[error("session {id} is not running (state: {state})")]
    NotRunning { id: String, state: String },

    /// Snapshotting the container failed
    #[error("failed to commit {id} to image {image}: {message}")]
    Commit {
        id: String,
        image: String,
        message: String,
    },

    /// Exec exceeded its configured time limit
    #[error("command `{command}` timed out after {timeout_secs}s")]
    ExecTimeout { command: String, timeout_secs: u64 },

    /// The runtime call itself failed (spawn error, daemon error, HTTP error)
    #[error("container transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether this error is the "image absent" signal used for cache misses.
    pub fn is_image_missing(&self) -> bool {
        matches!(self, SessionError::ImagePull { .. })
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
