//! Provisioning error taxonomy.

use modelbake_session::SessionError;

/// Errors produced by the provisioning workflow.
///
/// Every variant is fatal for the current invocation; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("image not found: {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("step {step} exited with code {exit_code}: `{command}`: {stderr}")]
    StepExecution {
        step: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("step {step} timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("failed to commit image {image}: {message}")]
    Commit { image: String, message: String },

    #[error("transport error during {stage}: {source}")]
    Transport {
        stage: String,
        #[source]
        source: SessionError,
    },

    #[error("image {image} was built on {found}, expected {expected}")]
    IncompatibleImage {
        image: String,
        expected: String,
        found: String,
    },

    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Map a session-level failure observed during `stage`.
    pub fn from_session(stage: &str, err: SessionError) -> Self {
        match err {
            SessionError::ImagePull { image, message } => ProvisionError::ImagePull { image, message },
            SessionError::Commit { image, message, .. } => ProvisionError::Commit { image, message },
            SessionError::ExecTimeout { timeout_secs, .. } => ProvisionError::StepTimeout {
                step: stage.to_string(),
                timeout_secs,
            },
            other => ProvisionError::Transport {
                stage: stage.to_string(),
                source: other,
            },
        }
    }

    /// Name of the pipeline step or stage the error is attributed to, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            ProvisionError::StepExecution { step, .. }
            | ProvisionError::StepTimeout { step, .. }
            | ProvisionError::Transport { stage: step, .. } => Some(step),
            ProvisionError::Commit { .. } => Some("commit"),
            _ => None,
        }
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
