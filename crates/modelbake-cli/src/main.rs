//! modelbake - cached model-serving images
//!
//! ## Commands
//!
//! - `provision`: reuse or build the image for a model, optionally validate it
//! - `exists`: check whether an image is in the local store
//! - `tags`: list models served by a running endpoint
//! - `generate` / `chat` / `embed`: one request against a running endpoint

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use modelbake_core::{
    BakeConfig, CleanupPolicy, ImageCache, MaterializeOutcome, Materializer, ModelDescriptor,
    TargetImage,
};
use modelbake_serving::{
    ChatMessage, ChatRequest, EmbeddingRequest, GenerateRequest, ServingClient,
};
use modelbake_session::{ContainerRuntime, DockerRuntime};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "modelbake")]
#[command(author = "Stevedores Org")]
#[command(version = modelbake_core::VERSION)]
#[command(about = "Cached Ollama images provisioned from Hugging Face models", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "MODELBAKE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reuse the image for a model, building it first if it does not exist
    Provision {
        #[command(flatten)]
        model: ModelArgs,

        /// Target image name (the cache key)
        #[arg(short, long)]
        image: String,

        /// Base serving image (overrides config)
        #[arg(long)]
        base_image: Option<String>,

        /// Cleanup of raw weights: skip, fatal or best-effort
        #[arg(long)]
        cleanup: Option<CleanupPolicy>,

        /// Check the served model after provisioning
        #[arg(long, value_enum)]
        validate: Option<Validation>,

        /// Prompt used by generate/embed validation
        #[arg(long, default_value = "hello")]
        prompt: String,

        /// Leave the serving container running
        #[arg(long)]
        keep_running: bool,

        /// Print the provisioning outcome as JSON
        #[arg(long)]
        report: bool,
    },

    /// Check whether an image exists in the local store
    Exists {
        /// Image name
        image: String,
    },

    /// List models served by an endpoint
    Tags {
        #[arg(short, long, default_value = "http://127.0.0.1:11434")]
        endpoint: String,
    },

    /// Generate a completion
    Generate {
        #[arg(short, long, default_value = "http://127.0.0.1:11434")]
        endpoint: String,

        #[arg(short, long)]
        model: String,

        #[arg(short, long)]
        prompt: String,

        /// Image files to attach (multimodal models)
        #[arg(long = "image-file")]
        images: Vec<PathBuf>,
    },

    /// Send a chat conversation
    Chat {
        #[arg(short, long, default_value = "http://127.0.0.1:11434")]
        endpoint: String,

        #[arg(short, long)]
        model: String,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        /// User messages, in order
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Compute an embedding
    Embed {
        #[arg(short, long, default_value = "http://127.0.0.1:11434")]
        endpoint: String,

        #[arg(short, long)]
        model: String,

        #[arg(short, long)]
        prompt: String,
    },
}

/// Model selection: a descriptor file or inline fields.
#[derive(clap::Args, Debug, Clone)]
struct ModelArgs {
    /// Descriptor file (.toml or .json)
    #[arg(short, long, conflicts_with_all = ["repo", "weights"])]
    descriptor: Option<PathBuf>,

    /// Hugging Face repository id
    #[arg(long, requires = "weights")]
    repo: Option<String>,

    /// Primary weight file in the repository
    #[arg(long = "weights", requires = "repo")]
    weights: Option<String>,

    /// Adapter weight file (vision projector)
    #[arg(long)]
    adapter: Option<String>,

    /// Local file holding the model definition text
    #[arg(long)]
    definition: Option<PathBuf>,

    /// Name to register the model under
    #[arg(long)]
    model_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Validation {
    /// The model is listed by /api/tags
    List,
    /// A generate request returns a non-empty response
    Generate,
    /// An embeddings request returns a non-empty vector
    Embed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    modelbake_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Provision {
            model,
            image,
            base_image,
            cleanup,
            validate,
            prompt,
            keep_running,
            report,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(base) = base_image {
                config.base_image = base;
            }
            if let Some(policy) = cleanup {
                config.cleanup = policy;
            }
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(
                DockerRuntime::new(config.docker.clone())
                    .context("Failed to set up the docker runtime")?,
            );
            let request = ProvisionRequest {
                descriptor: model.to_descriptor()?,
                image,
                validate,
                prompt,
                keep_running,
            };
            let output = cmd_provision(runtime, config, &request).await?;
            print_provision(&output, report)
        }
        Commands::Exists { image } => {
            let config = load_config(cli.config.as_deref())?;
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(
                DockerRuntime::new(config.docker.clone())
                    .context("Failed to set up the docker runtime")?,
            );
            cmd_exists(runtime, &image).await
        }
        Commands::Tags { endpoint } => cmd_tags(&endpoint).await,
        Commands::Generate {
            endpoint,
            model,
            prompt,
            images,
        } => cmd_generate(&endpoint, &model, &prompt, &images).await,
        Commands::Chat {
            endpoint,
            model,
            system,
            messages,
        } => cmd_chat(&endpoint, &model, system.as_deref(), &messages).await,
        Commands::Embed {
            endpoint,
            model,
            prompt,
        } => cmd_embed(&endpoint, &model, &prompt).await,
    }
}

/// Defaults or the given TOML file, overlaid with `MODELBAKE_*` variables.
fn load_config(path: Option<&Path>) -> Result<BakeConfig> {
    let config = match path {
        Some(path) => BakeConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BakeConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid MODELBAKE_* environment variable")
}

impl ModelArgs {
    fn to_descriptor(&self) -> Result<ModelDescriptor> {
        if let Some(path) = &self.descriptor {
            return ModelDescriptor::from_file(path)
                .with_context(|| format!("Failed to load descriptor {}", path.display()));
        }

        let (Some(repo), Some(weights)) = (&self.repo, &self.weights) else {
            bail!("either --descriptor or both --repo and --weights are required");
        };

        let mut builder = ModelDescriptor::builder(repo.clone(), weights.clone());
        if let Some(adapter) = &self.adapter {
            builder = builder.adapter_weight_file(adapter.clone());
        }
        if let Some(path) = &self.definition {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read definition {}", path.display()))?;
            builder = builder.definition_text(text);
        }
        if let Some(name) = &self.model_name {
            builder = builder.model_name(name.clone());
        }
        Ok(builder.build()?)
    }
}

struct ProvisionRequest {
    descriptor: ModelDescriptor,
    image: String,
    validate: Option<Validation>,
    prompt: String,
    keep_running: bool,
}

#[derive(Debug, Serialize)]
struct ProvisionOutput {
    image: String,
    served_model: String,
    endpoint: Option<String>,
    container: Option<String>,
    #[serde(flatten)]
    outcome: MaterializeOutcome,
    validation: Option<String>,
}

/// Materialize the image, validate it, and stop the serving session unless
/// asked to keep it.
async fn cmd_provision(
    runtime: Arc<dyn ContainerRuntime>,
    config: BakeConfig,
    request: &ProvisionRequest,
) -> Result<ProvisionOutput> {
    let target = TargetImage::new(request.image.clone(), config.base_image.clone())?;
    let materializer = Materializer::new(runtime, config);

    let mut materialized = materializer
        .materialize(&request.descriptor, &target)
        .await
        .with_context(|| format!("Failed to provision {}", target))?;
    let endpoint = materialized.endpoint().map(str::to_string);
    let served_model = request.descriptor.served_model();

    let validation = match (request.validate, &endpoint) {
        (None, _) => Ok(None),
        (Some(_), None) => Err(anyhow::anyhow!("serving session has no published endpoint")),
        (Some(kind), Some(endpoint)) => validate(endpoint, &served_model, kind, &request.prompt)
            .await
            .map(Some),
    };

    let keep = request.keep_running && validation.is_ok();
    let container = if keep {
        Some(materialized.session.id().to_string())
    } else {
        if let Err(e) = materialized.session.stop().await {
            warn!(container = %materialized.session.id(), error = %e, "Failed to stop serving container");
        }
        None
    };

    Ok(ProvisionOutput {
        image: target.name,
        served_model,
        endpoint: endpoint.filter(|_| keep),
        container,
        outcome: materialized.outcome,
        validation: validation?,
    })
}

async fn validate(endpoint: &str, model: &str, kind: Validation, prompt: &str) -> Result<String> {
    let client = ServingClient::new(endpoint)?;
    client
        .ensure_model_listed(model)
        .await
        .with_context(|| format!("Model {} is not served at {}", model, endpoint))?;

    let summary = match kind {
        Validation::List => format!("{} listed", model),
        Validation::Generate => {
            let response = client
                .ensure_generates(&GenerateRequest::new(model, prompt))
                .await
                .context("Generate validation failed")?;
            format!("generated {} chars", response.chars().count())
        }
        Validation::Embed => {
            let embedding = client
                .ensure_embeds(&EmbeddingRequest {
                    model: model.to_string(),
                    prompt: prompt.to_string(),
                })
                .await
                .context("Embedding validation failed")?;
            format!("embedding of dimension {}", embedding.len())
        }
    };
    info!(model = %model, result = %summary, "Validation passed");
    Ok(summary)
}

fn print_provision(output: &ProvisionOutput, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }

    match &output.outcome {
        MaterializeOutcome::Reused => println!("Reused image {}", output.image),
        MaterializeOutcome::Built(report) => {
            println!(
                "Built image {} from {} in {} ms ({} steps)",
                report.image,
                report.base_image,
                report.duration_ms,
                report.steps.len()
            );
            println!("Descriptor digest: {}", report.descriptor_digest);
        }
    }
    println!("Model: {}", output.served_model);
    if let Some(validation) = &output.validation {
        println!("Validation: {}", validation);
    }
    if let (Some(container), Some(endpoint)) = (&output.container, &output.endpoint) {
        println!("Serving container {} at {}", container, endpoint);
    }
    Ok(())
}

async fn cmd_exists(runtime: Arc<dyn ContainerRuntime>, image: &str) -> Result<()> {
    let cache = ImageCache::new(runtime, false);
    if cache.exists(image).await? {
        println!("{} exists", image);
        Ok(())
    } else {
        bail!("{} not found", image)
    }
}

async fn cmd_tags(endpoint: &str) -> Result<()> {
    let tags = ServingClient::new(endpoint)?
        .tags()
        .await
        .with_context(|| format!("Failed to list models at {}", endpoint))?;

    if tags.models.is_empty() {
        println!("No models served at {}", endpoint);
    }
    for name in tags.names() {
        println!("{}", name);
    }
    Ok(())
}

async fn cmd_generate(endpoint: &str, model: &str, prompt: &str, images: &[PathBuf]) -> Result<()> {
    let mut request = GenerateRequest::new(model, prompt);
    for path in images {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
        request = request.with_image_bytes(&bytes);
    }

    let response = ServingClient::new(endpoint)?.generate(&request).await?;
    println!("{}", response.response);
    Ok(())
}

async fn cmd_chat(endpoint: &str, model: &str, system: Option<&str>, messages: &[String]) -> Result<()> {
    let request = chat_request(model, system, messages);
    let response = ServingClient::new(endpoint)?.chat(&request).await?;
    println!("{}", response.message.content);
    Ok(())
}

fn chat_request(model: &str, system: Option<&str>, messages: &[String]) -> ChatRequest {
    let mut turns: Vec<ChatMessage> = system.map(ChatMessage::system).into_iter().collect();
    turns.extend(messages.iter().map(|m| ChatMessage::user(m.as_str())));
    ChatRequest {
        model: model.to_string(),
        messages: turns,
        stream: false,
    }
}

async fn cmd_embed(endpoint: &str, model: &str, prompt: &str) -> Result<()> {
    let request = EmbeddingRequest {
        model: model.to_string(),
        prompt: prompt.to_string(),
    };
    let response = ServingClient::new(endpoint)?.embeddings(&request).await?;
    println!("{}", serde_json::to_string(&response.embedding)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use clap::CommandFactory;
    use modelbake_session::fakes::FakeRuntime;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const BASE: &str = "ollama/ollama:0.1.44";

    /// Answer each request with the body of the first route whose prefix
    /// matches its request line. Returns the base URL and the raw requests.
    async fn serving_endpoint(
        routes: Vec<(&'static str, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_server = seen.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let content_length = text[..head_end]
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if buf.len() >= head_end + 4 + content_length {
                            break;
                        }
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _)| request.starts_with(prefix))
                    .map(|(_, body)| (200, *body))
                    .unwrap_or((404, "not found"));
                seen_server.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });

        (format!("http://{}", addr), seen)
    }

    fn body_of(request: &str) -> serde_json::Value {
        let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
        serde_json::from_str(body).unwrap()
    }

    fn request(keep_running: bool) -> ProvisionRequest {
        ProvisionRequest {
            descriptor: ModelDescriptor::new("org/model-gguf", "model-q4.gguf").unwrap(),
            image: "model-served".to_string(),
            validate: None,
            prompt: "hello".to_string(),
            keep_running,
        }
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
        assert_eq!(Cli::command().get_version(), Some(modelbake_core::VERSION));
    }

    #[test]
    fn test_model_args_inline_and_file() {
        let cli = Cli::parse_from([
            "modelbake",
            "provision",
            "--repo",
            "vikhyatk/moondream2",
            "--weights",
            "moondream2-text-model-f16.gguf",
            "--adapter",
            "moondream2-mmproj-f16.gguf",
            "--model-name",
            "moondream",
            "--image",
            "moondream-served",
            "--cleanup",
            "best-effort",
        ]);
        let Commands::Provision { model, cleanup, .. } = cli.command else {
            panic!("expected provision");
        };
        assert_eq!(cleanup, Some(CleanupPolicy::BestEffort));
        let d = model.to_descriptor().unwrap();
        assert_eq!(d.model_name(), "moondream");
        assert_eq!(d.adapter_weight_file(), Some("moondream2-mmproj-f16.gguf"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(
            &path,
            "source_repository = \"org/m\"\nprimary_weight_file = \"m.gguf\"\n",
        )
        .unwrap();
        let from_file = ModelArgs {
            descriptor: Some(path),
            repo: None,
            weights: None,
            adapter: None,
            definition: None,
            model_name: None,
        };
        assert_eq!(from_file.to_descriptor().unwrap().definition_text(), "FROM m.gguf");
    }

    #[test]
    fn test_model_args_require_a_source() {
        let none = ModelArgs {
            descriptor: None,
            repo: None,
            weights: None,
            adapter: None,
            definition: None,
            model_name: None,
        };
        assert!(none.to_descriptor().is_err());
    }

    #[test]
    fn test_chat_request_puts_system_first() {
        let req = chat_request("m", Some("Be brief."), &["hi".to_string(), "again".to_string()]);
        let roles: Vec<&str> = req.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user"]);
        assert!(!req.stream);
    }

    #[tokio::test]
    async fn test_provision_builds_then_reuses_and_stops() {
        let runtime = FakeRuntime::new().with_image(BASE);

        let first = cmd_provision(Arc::new(runtime.clone()), BakeConfig::default(), &request(false))
            .await
            .unwrap();
        assert!(matches!(first.outcome, MaterializeOutcome::Built(_)));
        assert!(first.container.is_none());

        let second = cmd_provision(Arc::new(runtime.clone()), BakeConfig::default(), &request(true))
            .await
            .unwrap();
        assert!(matches!(second.outcome, MaterializeOutcome::Reused));
        assert_eq!(second.served_model, "model-q4.gguf:latest");

        let started = runtime.started_sessions();
        assert_eq!(started.len(), 3, "build, serve, serve");
        assert_eq!(runtime.stop_count(&started[0].0), 1);
        assert_eq!(runtime.stop_count(&started[1].0), 1);
        assert_eq!(runtime.stop_count(&started[2].0), 0, "kept running");
        assert_eq!(second.container.as_deref(), Some(started[2].0.as_str()));

        let json = serde_json::to_value(&second).unwrap();
        assert_eq!(json["outcome"], "reused");
    }

    #[tokio::test]
    async fn test_provision_generate_validation_stops_serving_session() {
        let (endpoint, seen) = serving_endpoint(vec![
            ("GET /api/tags", r#"{"models":[{"name":"model-q4.gguf:latest"}]}"#),
            ("POST /api/generate", r#"{"response":"Hi there!"}"#),
        ])
        .await;
        let runtime = FakeRuntime::new().with_image(BASE).with_endpoint(&endpoint);
        let request = ProvisionRequest {
            validate: Some(Validation::Generate),
            ..request(false)
        };

        let output = cmd_provision(Arc::new(runtime.clone()), BakeConfig::default(), &request)
            .await
            .unwrap();
        assert!(matches!(output.outcome, MaterializeOutcome::Built(_)));
        assert_eq!(output.validation.as_deref(), Some("generated 9 chars"));
        assert!(output.container.is_none());
        assert!(output.endpoint.is_none());

        let requests = seen.lock().unwrap().clone();
        let generate = requests
            .iter()
            .find(|r| r.starts_with("POST /api/generate"))
            .expect("generate request sent");
        assert_eq!(
            body_of(generate),
            json!({"model": "model-q4.gguf:latest", "prompt": "hello", "images": [], "stream": false})
        );

        let started = runtime.started_sessions();
        assert_eq!(started.len(), 2, "build, serve");
        assert_eq!(runtime.stop_count(&started[1].0), 1, "serving session stopped");
    }

    #[tokio::test]
    async fn test_provision_unlisted_model_fails_and_stops_container() {
        let (endpoint, seen) =
            serving_endpoint(vec![("GET /api/tags", r#"{"models":[{"name":"other:latest"}]}"#)])
                .await;
        let runtime = FakeRuntime::new().with_image(BASE).with_endpoint(&endpoint);
        let request = ProvisionRequest {
            validate: Some(Validation::Generate),
            ..request(true)
        };

        let err = cmd_provision(Arc::new(runtime.clone()), BakeConfig::default(), &request)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("model-q4.gguf:latest"));

        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|r| !r.starts_with("POST /api/generate")));
        let started = runtime.started_sessions();
        assert!(!started.is_empty());
        for (id, _) in &started {
            assert_eq!(runtime.stop_count(id), 1, "container {} left running", id);
        }
    }

    #[tokio::test]
    async fn test_exists_reports_missing_image() {
        let runtime = FakeRuntime::new().with_image("model-served");
        assert!(cmd_exists(Arc::new(runtime.clone()), "model-served").await.is_ok());
        assert!(cmd_exists(Arc::new(runtime), "other-served").await.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modelbake.toml");
        std::fs::write(&path, "cleanup = \"skip\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.cleanup, CleanupPolicy::Skip);
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
