//! Docker CLI backend
//!
//! Drives the local Docker daemon through the `docker` binary. Containers
//! publish the serving port on a random loopback port; `start` waits until
//! the endpoint answers HTTP before handing the session out.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{
    ContainerRuntime, ContainerSession, ExecOutput, ExecRequest, ImageLabels, SessionResult,
    SessionState, StartOptions,
};

/// Port the Ollama server listens on inside the container.
pub const DEFAULT_SERVING_PORT: u16 = 11434;

/// Docker backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker CLI binary
    pub docker_bin: String,
    /// Container port to publish
    pub serving_port: u16,
    /// Host interface the port is published on
    pub bind_host: String,
    /// Maximum time to wait for the endpoint after `docker run`
    pub startup_timeout_secs: u64,
    /// Delay between readiness probes
    pub probe_interval_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            docker_bin: "docker".to_string(),
            serving_port: DEFAULT_SERVING_PORT,
            bind_host: "127.0.0.1".to_string(),
            startup_timeout_secs: 120,
            probe_interval_ms: 500,
        }
    }
}

/// Docker-backed container runtime
pub struct DockerRuntime {
    config: DockerConfig,
    http_client: reqwest::Client,
}

impl DockerRuntime {
    /// Create a new runtime
    pub fn new(config: DockerConfig) -> SessionResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("modelbake-session/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(DockerRuntime {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    /// Resolve the host address docker mapped the serving port to.
    async fn published_endpoint(&self, id: &str) -> SessionResult<String> {
        let port_spec = format!("{}/tcp", self.config.serving_port);
        let output = run_docker(&self.config.docker_bin, &["port", id, &port_spec], None).await?;
        if output.exit_code != 0 {
            return Err(SessionError::StartFailed {
                image: id.to_string(),
                message: format!("no published port: {}", output.stderr.trim()),
            });
        }
        parse_port_mapping(&output.stdout).ok_or_else(|| SessionError::StartFailed {
            image: id.to_string(),
            message: format!("unrecognised port mapping: {}", output.stdout.trim()),
        })
    }

    /// Poll the endpoint until it answers or the startup timeout elapses.
    async fn wait_until_ready(&self, id: &str, endpoint: &str) -> SessionResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        let interval = Duration::from_millis(self.config.probe_interval_ms);

        loop {
            match self.http_client.get(endpoint).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(id = %id, endpoint = %endpoint, "Serving endpoint ready");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(id = %id, status = %response.status(), "Endpoint not ready yet");
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "Endpoint not reachable yet");
                }
            }

            if Instant::now() >= deadline {
                return Err(SessionError::StartupTimeout {
                    id: id.to_string(),
                    endpoint: endpoint.to_string(),
                    timeout_secs: self.config.startup_timeout_secs,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(
        &self,
        image: &str,
        options: &StartOptions,
    ) -> SessionResult<Box<dyn ContainerSession>> {
        let publish = format!("{}::{}", self.config.bind_host, self.config.serving_port);
        let args = [
            "run",
            "-d",
            "--pull",
            options.pull.as_flag(),
            "-p",
            publish.as_str(),
            image,
        ];

        info!(image = %image, pull = options.pull.as_flag(), "Starting container");
        let output = run_docker(&self.config.docker_bin, &args, None).await?;
        if output.exit_code != 0 {
            let message = output.stderr.trim().to_string();
            if is_missing_image(&message) {
                return Err(SessionError::ImagePull {
                    image: image.to_string(),
                    message,
                });
            }
            return Err(SessionError::StartFailed {
                image: image.to_string(),
                message,
            });
        }

        let mut session = DockerSession {
            docker_bin: self.config.docker_bin.clone(),
            id: output.stdout.trim().to_string(),
            base_image: image.to_string(),
            endpoint: None,
            state: SessionState::Created,
        };

        let ready = async {
            let endpoint = self.published_endpoint(&session.id).await?;
            self.wait_until_ready(&session.id, &endpoint).await?;
            Ok::<_, SessionError>(endpoint)
        }
        .await;

        match ready {
            Ok(endpoint) => {
                session.endpoint = Some(endpoint);
                session.state = SessionState::Started;
                info!(id = %session.id, endpoint = ?session.endpoint, "Container started");
                Ok(Box::new(session))
            }
            Err(e) => {
                // The container exists but never became usable; remove it.
                if let Err(stop_err) = session.stop().await {
                    warn!(id = %session.id, error = %stop_err, "Failed to remove unready container");
                }
                Err(e)
            }
        }
    }

    async fn image_exists(&self, name: &str) -> SessionResult<bool> {
        let output = run_docker(
            &self.config.docker_bin,
            &["image", "inspect", "--format", "{{.Id}}", name],
            None,
        )
        .await?;

        if output.exit_code == 0 {
            return Ok(true);
        }
        if is_missing_image(&output.stderr) {
            return Ok(false);
        }
        Err(SessionError::Transport(output.stderr.trim().to_string()))
    }

    async fn image_labels(&self, name: &str) -> SessionResult<ImageLabels> {
        let output = run_docker(
            &self.config.docker_bin,
            &["image", "inspect", "--format", "{{json .Config.Labels}}", name],
            None,
        )
        .await?;

        if output.exit_code != 0 {
            let message = output.stderr.trim().to_string();
            if is_missing_image(&message) {
                return Err(SessionError::ImagePull {
                    image: name.to_string(),
                    message,
                });
            }
            return Err(SessionError::Transport(message));
        }

        let labels: Option<ImageLabels> = serde_json::from_str(output.stdout.trim())?;
        Ok(labels.unwrap_or_default())
    }
}

/// A container started through the Docker CLI
#[derive(Debug)]
pub struct DockerSession {
    docker_bin: String,
    id: String,
    base_image: String,
    endpoint: Option<String>,
    state: SessionState,
}

impl DockerSession {
    fn ensure_running(&self) -> SessionResult<()> {
        if !self.state.is_running() {
            return Err(SessionError::NotRunning {
                id: self.id.clone(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerSession for DockerSession {
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
        self.endpoint.as_deref()
    }

    async fn exec(&mut self, request: &ExecRequest) -> SessionResult<ExecOutput> {
        self.ensure_running()?;
        if request.argv.is_empty() {
            return Err(SessionError::Transport("empty command".to_string()));
        }

        let mut args: Vec<String> = vec!["exec".to_string()];
        if request.stdin.is_some() {
            args.push("-i".to_string());
        }
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.id.clone());
        args.extend(request.argv.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        debug!(id = %self.id, command = %request.display(), "Exec in container");
        let run = run_docker(&self.docker_bin, &args, request.stdin.as_deref());
        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                SessionError::ExecTimeout {
                    command: request.display(),
                    timeout_secs: limit.as_secs(),
                }
            })??,
            None => run.await?,
        };

        // Exit codes from the CLI itself (not the command) are transport failures.
        if output.exit_code != 0 && is_daemon_error(&output.stderr) {
            return Err(SessionError::Transport(output.stderr.trim().to_string()));
        }
        Ok(output)
    }

    async fn commit_to_image(&mut self, name: &str, labels: &ImageLabels) -> SessionResult<()> {
        if !self.state.is_running() {
            return Err(SessionError::Commit {
                id: self.id.clone(),
                image: name.to_string(),
                message: format!("session is {}", self.state),
            });
        }

        let mut args: Vec<String> = vec!["commit".to_string()];
        for (key, value) in labels {
            args.push("--change".to_string());
            args.push(format!("LABEL {}={}", key, quote_label_value(value)));
        }
        args.push(self.id.clone());
        args.push(name.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = run_docker(&self.docker_bin, &args, None).await?;
        if output.exit_code != 0 {
            return Err(SessionError::Commit {
                id: self.id.clone(),
                image: name.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        self.state = SessionState::Committed;
        info!(id = %self.id, image = %name, "Committed container to image");
        Ok(())
    }

    async fn stop(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }

        let output = run_docker(&self.docker_bin, &["rm", "-f", &self.id], None).await?;
        if output.exit_code != 0 && !output.stderr.contains("No such container") {
            return Err(SessionError::Transport(output.stderr.trim().to_string()));
        }

        self.state = SessionState::Stopped;
        debug!(id = %self.id, "Container removed");
        Ok(())
    }
}

/// Run the docker CLI and capture its output.
async fn run_docker(docker_bin: &str, args: &[&str], stdin: Option<&[u8]>) -> SessionResult<ExecOutput> {
    let mut child = Command::new(docker_bin)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SessionError::Transport(format!("failed to spawn {}: {}", docker_bin, e)))?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Whether docker's stderr says the image does not exist (locally or remotely).
pub fn is_missing_image(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "no such image",
        "unable to find image",
        "pull access denied",
        "manifest unknown",
        "repository does not exist",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn is_daemon_error(stderr: &str) -> bool {
    let trimmed = stderr.trim_start();
    trimmed.starts_with("Error response from daemon")
        || trimmed.starts_with("Error: No such container")
        || trimmed.starts_with("Cannot connect to the Docker daemon")
}

/// Parse `docker port` output into a base URL, preferring IPv4.
fn parse_port_mapping(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let mapping = lines
        .iter()
        .find(|l| !l.starts_with('['))
        .or_else(|| lines.first())?;

    let (host, port) = mapping.rsplit_once(':')?;
    let host = match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "[::]" => "[::1]",
        other => other,
    };
    Some(format!("http://{}:{}", host, port))
}

fn quote_label_value(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DockerConfig::default();
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.serving_port, 11434);
        assert_eq!(config.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_missing_image_detection() {
        assert!(is_missing_image(
            "Error: No such image: model-served"
        ));
        assert!(is_missing_image(
            "docker: Error response from daemon: No such image: model-served:latest."
        ));
        assert!(is_missing_image(
            "Unable to find image 'model-served:latest' locally"
        ));
        assert!(is_missing_image(
            "Error response from daemon: pull access denied for model-served, repository does not exist"
        ));
        assert!(!is_missing_image(
            "docker: Error response from daemon: driver failed programming external connectivity"
        ));
    }

    #[test]
    fn test_daemon_error_detection() {
        assert!(is_daemon_error("Error response from daemon: container abc is not running"));
        assert!(is_daemon_error("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"));
        assert!(!is_daemon_error("E: Unable to locate package python3-pip"));
    }

    #[test]
    fn test_parse_port_mapping_prefers_ipv4() {
        let out = "0.0.0.0:49153\n[::]:49153\n";
        assert_eq!(
            parse_port_mapping(out).as_deref(),
            Some("http://127.0.0.1:49153")
        );

        let out = "127.0.0.1:32768\n";
        assert_eq!(
            parse_port_mapping(out).as_deref(),
            Some("http://127.0.0.1:32768")
        );

        let out = "[::]:40000\n";
        assert_eq!(parse_port_mapping(out).as_deref(), Some("http://[::1]:40000"));

        assert!(parse_port_mapping("").is_none());
    }

    #[test]
    fn test_quote_label_value() {
        assert_eq!(quote_label_value("ollama/ollama:0.1.44"), "ollama/ollama:0.1.44");
        assert_eq!(quote_label_value("two words"), "\"two words\"");
    }

    #[test]
    fn test_docker_config_default_port() {
        let config = DockerConfig::default();
        assert_eq!(config.serving_port, 11434);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert!(config.startup_timeout_secs > 0);
    }
}
