//! Session trait definitions
//!
//! - `ContainerRuntime`: starts sessions and answers image-store queries
//! - `ContainerSession`: a running container (exec, commit, stop)
//!
//! Both traits are async and backend-agnostic. The Docker CLI backend lives
//! in the `docker` module; in-memory fakes are in `fakes`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Result type for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Image labels attached at commit time.
pub type ImageLabels = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a container session.
///
/// `Created -> Started -> (Committed | Stopped)`, and `Committed -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Started,
    Committed,
    Stopped,
}

impl SessionState {
    /// Commands and commits are only accepted while started.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Started)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Started => "started",
            SessionState::Committed => "committed",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Whether `start` may fetch the image from a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Only use the local image store; absence is an `ImagePull` error.
    Never,
    /// Pull from the registry when the image is not present locally.
    Missing,
}

impl PullPolicy {
    /// Value passed to `docker run --pull`.
    pub fn as_flag(&self) -> &'static str {
        match self {
            PullPolicy::Never => "never",
            PullPolicy::Missing => "missing",
        }
    }
}

/// Options for starting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub pull: PullPolicy,
}

impl StartOptions {
    /// Start only from a locally present image.
    pub fn local_only() -> Self {
        Self {
            pull: PullPolicy::Never,
        }
    }

    /// Start from an image, pulling it if needed.
    pub fn pull_if_missing() -> Self {
        Self {
            pull: PullPolicy::Missing,
        }
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// A command to run inside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector (first element is the executable).
    pub argv: Vec<String>,

    /// Bytes piped to the command's standard input.
    pub stdin: Option<Vec<u8>>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Wall-clock limit; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Space-joined command line, for logs and error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of an exec. A non-zero exit code is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A running container owned by exactly one workflow.
#[async_trait]
pub trait ContainerSession: Send {
    /// Opaque runtime handle (container id).
    fn id(&self) -> &str;

    /// Image the session was started from.
    fn base_image(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Base URL of the published serving port, set once started.
    fn published_endpoint(&self) -> Option<&str>;

    /// Run a command to completion and capture its output.
    ///
    /// Never fails for a non-zero exit code; only for session-level
    /// failures (not running, transport, timeout).
    async fn exec(&mut self, request: &ExecRequest) -> SessionResult<ExecOutput>;

    /// Snapshot the container filesystem as image `name`.
    ///
    /// Only valid while `Started`, and at most once per session.
    async fn commit_to_image(&mut self, name: &str, labels: &ImageLabels) -> SessionResult<()>;

    /// Terminate the session. Idempotent.
    async fn stop(&mut self) -> SessionResult<()>;
}

/// Container runtime and image store.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a session from `image` and wait until its endpoint is reachable.
    ///
    /// Returns `SessionError::ImagePull` when the image is absent, which
    /// callers use as the cache-miss signal.
    async fn start(
        &self,
        image: &str,
        options: &StartOptions,
    ) -> SessionResult<Box<dyn ContainerSession>>;

    /// Check whether an image with this name exists in the local store.
    async fn image_exists(&self, name: &str) -> SessionResult<bool>;

    /// Labels recorded on an image. `ImagePull` if the image is absent.
    async fn image_labels(&self, name: &str) -> SessionResult<ImageLabels>;
}
