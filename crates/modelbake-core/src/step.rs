//! Build steps and the per-run build plan.

use std::time::Duration;

use modelbake_session::ExecRequest;
use serde::{Deserialize, Serialize};

use crate::config::{BakeConfig, CleanupPolicy};
use crate::descriptor::ModelDescriptor;
use crate::provisioner::ProvisionState;

/// Kinds of pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// apt-get update
    RefreshIndex,

    /// apt-get upgrade -y
    UpgradePackages,

    /// apt-get install -y python3-pip
    InstallPip,

    /// pip install huggingface-hub
    InstallHubClient,

    /// huggingface-cli download <repo> <primary> --local-dir <dir>
    DownloadPrimary,

    /// huggingface-cli download <repo> <adapter> --local-dir <dir>
    DownloadAdapter,

    /// Write the definition text to the definition file
    WriteDefinition,

    /// ollama create <model> -f <definition file>
    Register,

    /// rm -f <weight files>
    Cleanup,
}

impl StepKind {
    /// Get the step name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::RefreshIndex => "refresh_index",
            StepKind::UpgradePackages => "upgrade_packages",
            StepKind::InstallPip => "install_pip",
            StepKind::InstallHubClient => "install_hub_client",
            StepKind::DownloadPrimary => "download_primary",
            StepKind::DownloadAdapter => "download_adapter",
            StepKind::WriteDefinition => "write_definition",
            StepKind::Register => "register",
            StepKind::Cleanup => "cleanup",
        }
    }

    /// State the pipeline enters when this step begins.
    pub fn entered_on_start(&self) -> Option<ProvisionState> {
        match self {
            StepKind::DownloadPrimary => Some(ProvisionState::Downloading),
            _ => None,
        }
    }

    /// State the pipeline enters when this step succeeds.
    pub fn entered_on_success(&self) -> Option<ProvisionState> {
        match self {
            StepKind::WriteDefinition => Some(ProvisionState::DefinitionWritten),
            StepKind::Register => Some(ProvisionState::Registered),
            _ => None,
        }
    }
}

/// One command of the build plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub kind: StepKind,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Text piped to the command's stdin.
    pub stdin: Option<String>,

    /// Extra environment for the command.
    pub env: Vec<(String, String)>,

    /// Whether a non-zero exit aborts the build.
    pub must_succeed: bool,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl BuildStep {
    fn new(kind: StepKind, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            kind,
            command,
            stdin: None,
            env: Vec::new(),
            must_succeed: true,
            timeout_secs,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Command line for logs and errors.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }

    pub fn to_exec_request(&self) -> ExecRequest {
        let mut request = ExecRequest::new(self.command.iter().cloned());
        if let Some(stdin) = &self.stdin {
            request = request.with_stdin(stdin.as_bytes().to_vec());
        }
        for (key, value) in &self.env {
            request = request.with_env(key.clone(), value.clone());
        }
        let timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        request.with_timeout(timeout)
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub kind: StepKind,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Generate the ordered build plan for a descriptor.
pub fn build_plan(descriptor: &ModelDescriptor, config: &BakeConfig) -> Vec<BuildStep> {
    let timeout = config.step_timeout_secs;
    let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let mut plan = vec![
        apt(BuildStep::new(StepKind::RefreshIndex, args(&["apt-get", "update"]), timeout)),
        apt(BuildStep::new(
            StepKind::UpgradePackages,
            args(&["apt-get", "upgrade", "-y"]),
            timeout,
        )),
        apt(BuildStep::new(
            StepKind::InstallPip,
            args(&["apt-get", "install", "-y", "python3-pip"]),
            timeout,
        )),
        BuildStep::new(
            StepKind::InstallHubClient,
            args(&["pip", "install", "huggingface-hub"]),
            timeout,
        ),
        download_step(
            StepKind::DownloadPrimary,
            descriptor.source_repository(),
            descriptor.primary_weight_file(),
            &config.download_dir,
            timeout,
        ),
    ];

    if let Some(adapter) = descriptor.adapter_weight_file() {
        plan.push(download_step(
            StepKind::DownloadAdapter,
            descriptor.source_repository(),
            adapter,
            &config.download_dir,
            timeout,
        ));
    }

    // Relative FROM paths resolve against the definition file's directory.
    let definition = definition_path(&config.download_dir, &config.definition_file);
    let mut write = BuildStep::new(
        StepKind::WriteDefinition,
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", shell_quote(&definition)),
        ],
        timeout,
    );
    write.stdin = Some(descriptor.definition_text().to_string());
    plan.push(write);

    plan.push(BuildStep::new(
        StepKind::Register,
        vec![
            "ollama".to_string(),
            "create".to_string(),
            descriptor.model_name().to_string(),
            "-f".to_string(),
            definition,
        ],
        timeout,
    ));

    if config.cleanup != CleanupPolicy::Skip {
        let mut command = args(&["rm", "-f"]);
        command.extend(
            descriptor
                .weight_files()
                .into_iter()
                .map(|file| weight_path(&config.download_dir, file)),
        );
        let mut cleanup = BuildStep::new(StepKind::Cleanup, command, timeout);
        cleanup.must_succeed = config.cleanup == CleanupPolicy::Fatal;
        plan.push(cleanup);
    }

    plan
}

fn apt(mut step: BuildStep) -> BuildStep {
    step.env
        .push(("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()));
    step
}

fn download_step(
    kind: StepKind,
    repository: &str,
    file: &str,
    download_dir: &str,
    timeout_secs: u64,
) -> BuildStep {
    BuildStep::new(
        kind,
        vec![
            "huggingface-cli".to_string(),
            "download".to_string(),
            repository.to_string(),
            file.to_string(),
            "--local-dir".to_string(),
            download_dir.to_string(),
        ],
        timeout_secs,
    )
}

/// Path of a downloaded weight file inside the container.
fn weight_path(download_dir: &str, file: &str) -> String {
    format!("{}/{}", download_dir.trim_end_matches('/'), file)
}

/// Path of the definition file, next to the downloaded weights.
fn definition_path(download_dir: &str, definition_file: &str) -> String {
    match download_dir {
        "." | "./" => definition_file.to_string(),
        dir => weight_path(dir, definition_file),
    }
}

/// Quote a word for `sh -c`.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}
