//! The build pipeline: base session in, committed image out.

use std::time::Instant;

use chrono::{DateTime, Utc};
use modelbake_session::{ContainerRuntime, ContainerSession, StartOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::build_labels;
use crate::config::BakeConfig;
use crate::descriptor::{ModelDescriptor, TargetImage};
use crate::error::{ProvisionError, ProvisionResult};
use crate::obs;
use crate::step::{build_plan, BuildStep, StepResult};

/// Pipeline states.
///
/// `Idle -> BaseStarted -> Downloading -> DefinitionWritten -> Registered
/// -> Committed`; `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Idle,
    BaseStarted,
    Downloading,
    DefinitionWritten,
    Registered,
    Committed,
    Failed,
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Committed | ProvisionState::Failed)
    }

    /// Whether the pipeline may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ProvisionState) -> bool {
        use ProvisionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, BaseStarted)
            | (BaseStarted, Downloading)
            | (Downloading, DefinitionWritten)
            | (DefinitionWritten, Registered)
            | (Registered, Committed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionState::Idle => "idle",
            ProvisionState::BaseStarted => "base_started",
            ProvisionState::Downloading => "downloading",
            ProvisionState::DefinitionWritten => "definition_written",
            ProvisionState::Registered => "registered",
            ProvisionState::Committed => "committed",
            ProvisionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Record of one successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    /// Image the build was committed as.
    pub image: String,

    /// Image the build session started from.
    pub base_image: String,

    /// Model registered with the serving engine.
    pub model_name: String,

    pub descriptor_digest: String,

    pub build_id: String,

    /// Container the build ran in.
    pub session_id: String,

    /// Executed steps, in order.
    pub steps: Vec<StepResult>,

    /// States visited, starting with `idle`.
    pub transitions: Vec<ProvisionState>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl ProvisionReport {
    pub fn final_state(&self) -> Option<ProvisionState> {
        self.transitions.last().copied()
    }
}

/// Tracks state transitions for one build.
#[derive(Debug)]
struct StateTracker {
    current: ProvisionState,
    visited: Vec<ProvisionState>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            current: ProvisionState::Idle,
            visited: vec![ProvisionState::Idle],
        }
    }

    fn advance(&mut self, next: ProvisionState) {
        if !self.current.can_transition_to(next) {
            warn!(from = %self.current, to = %next, "Unexpected provisioning state transition");
        }
        debug!(from = %self.current, to = %next, "Provisioning state transition");
        self.current = next;
        self.visited.push(next);
    }

    /// Move to `Failed`, returning the state the build failed in.
    fn fail(&mut self) -> ProvisionState {
        let failed_in = self.current;
        self.advance(ProvisionState::Failed);
        failed_in
    }
}

/// Runs the build pipeline. Holds no state between builds.
#[derive(Debug, Clone)]
pub struct Provisioner {
    config: BakeConfig,
}

impl Provisioner {
    pub fn new(config: BakeConfig) -> Self {
        Self { config }
    }

    /// Build `target` from scratch: start the base image, then run the
    /// pipeline in that session.
    ///
    /// The base image is `target.compatible_base`, pulled if absent. A
    /// failed start leaves nothing to clean up.
    pub async fn provision(
        &self,
        runtime: &dyn ContainerRuntime,
        descriptor: &ModelDescriptor,
        target: &TargetImage,
    ) -> ProvisionResult<ProvisionReport> {
        info!(image = %target.name, base = %target.compatible_base, "Starting base session");
        let session = runtime
            .start(&target.compatible_base, &StartOptions::pull_if_missing())
            .await
            .map_err(|e| {
                let err = ProvisionError::from_session("base_start", e);
                obs::emit_step_failed(&target.name, "base_start", &err);
                err
            })?;
        self.build_in_session(session, descriptor, target).await
    }

    /// Run every build step in `session` and commit it as `target.name`.
    ///
    /// Takes ownership of the session and stops it exactly once, whatever
    /// the outcome. A stop failure after a successful commit is only
    /// logged; the image already exists.
    pub async fn build_in_session(
        &self,
        mut session: Box<dyn ContainerSession>,
        descriptor: &ModelDescriptor,
        target: &TargetImage,
    ) -> ProvisionResult<ProvisionReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let build_id = Uuid::new_v4().to_string();

        let mut tracker = StateTracker::new();
        tracker.advance(ProvisionState::BaseStarted);

        let mut steps = Vec::new();
        let outcome = self
            .run_pipeline(
                session.as_mut(),
                descriptor,
                target,
                &build_id,
                &mut tracker,
                &mut steps,
            )
            .await;

        if let Err(e) = &outcome {
            let failed_in = tracker.fail();
            obs::emit_provision_failed(&target.name, failed_in, e);
        }

        if let Err(e) = session.stop().await {
            obs::emit_session_stop_error(session.id(), &e);
        }

        outcome?;

        Ok(ProvisionReport {
            image: target.name.clone(),
            base_image: session.base_image().to_string(),
            model_name: descriptor.model_name().to_string(),
            descriptor_digest: descriptor.digest(),
            build_id,
            session_id: session.id().to_string(),
            steps,
            transitions: tracker.visited,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn run_pipeline(
        &self,
        session: &mut dyn ContainerSession,
        descriptor: &ModelDescriptor,
        target: &TargetImage,
        build_id: &str,
        tracker: &mut StateTracker,
        steps: &mut Vec<StepResult>,
    ) -> ProvisionResult<()> {
        for step in build_plan(descriptor, &self.config) {
            if let Some(state) = step.kind.entered_on_start() {
                tracker.advance(state);
            }

            let result = run_step(session, &step).await.map_err(|e| {
                obs::emit_step_failed(&target.name, step.name(), &e);
                e
            })?;
            obs::emit_step_finished(&target.name, step.name(), result.exit_code, result.duration_ms);

            let passed = result.passed();
            let exit_code = result.exit_code;
            let stderr = result.stderr.clone();
            steps.push(result);

            if !passed {
                let err = ProvisionError::StepExecution {
                    step: step.name().to_string(),
                    command: step.display(),
                    exit_code,
                    stderr,
                };
                if step.must_succeed {
                    obs::emit_step_failed(&target.name, step.name(), &err);
                    return Err(err);
                }
                warn!(image = %target.name, error = %err, "Best-effort step failed, continuing");
                continue;
            }

            if let Some(state) = step.kind.entered_on_success() {
                tracker.advance(state);
            }
        }

        let labels = build_labels(descriptor, target, build_id);
        session
            .commit_to_image(&target.name, &labels)
            .await
            .map_err(|e| {
                let err = ProvisionError::from_session("commit", e);
                obs::emit_step_failed(&target.name, "commit", &err);
                err
            })?;
        tracker.advance(ProvisionState::Committed);
        obs::emit_image_committed(&target.name, build_id, &descriptor.digest());

        Ok(())
    }
}

/// Execute one step; a non-zero exit is returned as a result, not an error.
async fn run_step(session: &mut dyn ContainerSession, step: &BuildStep) -> ProvisionResult<StepResult> {
    debug!(step = step.name(), command = %step.display(), "Executing step");
    let start = Instant::now();

    let output = session
        .exec(&step.to_exec_request())
        .await
        .map_err(|e| ProvisionError::from_session(step.name(), e))?;

    Ok(StepResult {
        kind: step.kind,
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
