//! In-memory fakes for the session traits (testing only)
//!
//! `FakeRuntime` keeps an image store, an exec log and per-session stop
//! counters behind one shared state, so tests can inject failures and then
//! observe exactly which commands ran and which images exist.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::session::*;

/// One exec observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub session_id: String,
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecRecord {
    /// Whether any argument contains `token`.
    pub fn mentions(&self, token: &str) -> bool {
        self.argv.iter().any(|a| a.contains(token))
    }
}

#[derive(Debug, Clone)]
enum ExecFault {
    ExitCode { code: i32, stderr: String },
    Transport(String),
}

#[derive(Debug, Default)]
struct FakeState {
    images: BTreeMap<String, ImageLabels>,
    start_faults: BTreeMap<String, String>,
    exec_faults: Vec<(String, ExecFault)>,
    commit_fault: Option<String>,
    exec_log: Vec<ExecRecord>,
    started: Vec<(String, String)>,
    stops: BTreeMap<String, u32>,
    commits: Vec<String>,
    next_id: u64,
}

/// In-memory container runtime.
#[derive(Debug, Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    endpoint: String,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            endpoint: "http://127.0.0.1:11434".to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the image store with an unlabelled image.
    pub fn with_image(self, name: &str) -> Self {
        self.with_labelled_image(name, ImageLabels::new())
    }

    /// Seed the image store with a labelled image.
    pub fn with_labelled_image(self, name: &str, labels: ImageLabels) -> Self {
        self.lock().images.insert(name.to_string(), labels);
        self
    }

    /// Endpoint reported by every started session.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Make `start(image)` fail with a non-pull error.
    pub fn fail_start(self, image: &str, message: &str) -> Self {
        self.lock()
            .start_faults
            .insert(image.to_string(), message.to_string());
        self
    }

    /// Commands mentioning `token` exit with `code` and `stderr`.
    pub fn fail_exec_containing(self, token: &str, code: i32, stderr: &str) -> Self {
        self.lock().exec_faults.push((
            token.to_string(),
            ExecFault::ExitCode {
                code,
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    /// Commands mentioning `token` fail at the transport level.
    pub fn break_exec_containing(self, token: &str, message: &str) -> Self {
        self.lock()
            .exec_faults
            .push((token.to_string(), ExecFault::Transport(message.to_string())));
        self
    }

    /// Every commit fails with `message`.
    pub fn fail_commit(self, message: &str) -> Self {
        self.lock().commit_fault = Some(message.to_string());
        self
    }

    /// Remove an image out-of-band.
    pub fn remove_image(&self, name: &str) {
        self.lock().images.remove(name);
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.lock().images.contains_key(name)
    }

    pub fn labels_of(&self, name: &str) -> Option<ImageLabels> {
        self.lock().images.get(name).cloned()
    }

    /// All execs, in order.
    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.lock().exec_log.clone()
    }

    /// Number of execs whose arguments mention `token`.
    pub fn exec_count_containing(&self, token: &str) -> usize {
        self.lock()
            .exec_log
            .iter()
            .filter(|r| r.mentions(token))
            .count()
    }

    /// `(session id, image)` for every successful start, in order.
    pub fn started_sessions(&self) -> Vec<(String, String)> {
        self.lock().started.clone()
    }

    /// Number of `stop()` calls observed for a session.
    pub fn stop_count(&self, session_id: &str) -> u32 {
        self.lock().stops.get(session_id).copied().unwrap_or(0)
    }

    /// Image names passed to successful commits, in order.
    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(
        &self,
        image: &str,
        _options: &StartOptions,
    ) -> SessionResult<Box<dyn ContainerSession>> {
        let mut state = self.lock();
        if let Some(message) = state.start_faults.get(image) {
            return Err(SessionError::StartFailed {
                image: image.to_string(),
                message: message.clone(),
            });
        }
        if !state.images.contains_key(image) {
            return Err(SessionError::ImagePull {
                image: image.to_string(),
                message: format!("No such image: {}", image),
            });
        }

        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.started.push((id.clone(), image.to_string()));

        Ok(Box::new(FakeSession {
            runtime: self.clone(),
            id,
            base_image: image.to_string(),
            endpoint: self.endpoint.clone(),
            state: SessionState::Started,
        }))
    }

    async fn image_exists(&self, name: &str) -> SessionResult<bool> {
        Ok(self.has_image(name))
    }

    async fn image_labels(&self, name: &str) -> SessionResult<ImageLabels> {
        self.labels_of(name).ok_or_else(|| SessionError::ImagePull {
            image: name.to_string(),
            message: format!("No such image: {}", name),
        })
    }
}

/// Session handed out by `FakeRuntime`.
#[derive(Debug)]
pub struct FakeSession {
    runtime: FakeRuntime,
    id: String,
    base_image: String,
    endpoint: String,
    state: SessionState,
}

#[async_trait]
impl ContainerSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_image(&self) -> &str {
        &self.base_image
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn published_endpoint(&self) -> Option<&str> {
        match self.state {
            SessionState::Started | SessionState::Committed => Some(&self.endpoint),
            _ => None,
        }
    }

    async fn exec(&mut self, request: &ExecRequest) -> SessionResult<ExecOutput> {
        if !self.state.is_running() {
            return Err(SessionError::NotRunning {
                id: self.id.clone(),
                state: self.state.to_string(),
            });
        }

        let record = ExecRecord {
            session_id: self.id.clone(),
            argv: request.argv.clone(),
            stdin: request.stdin.clone(),
        };
        let mut state = self.runtime.lock();
        let fault = state
            .exec_faults
            .iter()
            .find(|(token, _)| record.mentions(token))
            .map(|(_, fault)| fault.clone());
        state.exec_log.push(record);

        match fault {
            Some(ExecFault::Transport(message)) => Err(SessionError::Transport(message)),
            Some(ExecFault::ExitCode { code, stderr }) => Ok(ExecOutput {
                exit_code: code,
                stdout: String::new(),
                stderr,
            }),
            None => Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    async fn commit_to_image(&mut self, name: &str, labels: &ImageLabels) -> SessionResult<()> {
        if !self.state.is_running() {
            return Err(SessionError::Commit {
                id: self.id.clone(),
                image: name.to_string(),
                message: format!("session is {}", self.state),
            });
        }

        let mut state = self.runtime.lock();
        if let Some(message) = &state.commit_fault {
            return Err(SessionError::Commit {
                id: self.id.clone(),
                image: name.to_string(),
                message: message.clone(),
            });
        }
        state.images.insert(name.to_string(), labels.clone());
        state.commits.push(name.to_string());
        drop(state);

        self.state = SessionState::Committed;
        Ok(())
    }

    async fn stop(&mut self) -> SessionResult<()> {
        *self.runtime.lock().stops.entry(self.id.clone()).or_insert(0) += 1;
        self.state = SessionState::Stopped;
        Ok(())
    }
}
