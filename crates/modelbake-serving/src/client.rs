//! Serving client
//!
//! Issues single requests against a started container's published endpoint
//! and parses just enough of the response to validate the provisioned model.

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::api::*;
use crate::error::{ServingError, ServingResult};

/// Default per-request timeout. Model loading on first request can be slow.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// HTTP client bound to one serving endpoint
#[derive(Debug, Clone)]
pub struct ServingClient {
    base_url: Url,
    http_client: reqwest::Client,
}

impl ServingClient {
    /// Create a client for `endpoint` (e.g. `http://127.0.0.1:49153`)
    pub fn new(endpoint: &str) -> ServingResult<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> ServingResult<Self> {
        let mut base_url = Url::parse(endpoint)
            .map_err(|e| ServingError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ServingError::InvalidEndpoint(endpoint.to_string()));
        }
        // API paths are joined relative to the base; keep any path prefix.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("modelbake-serving/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(ServingClient {
            base_url,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.base_url.as_str()
    }

    fn url(&self, path: &str) -> ServingResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServingError::InvalidEndpoint(format!("{}{}: {}", self.base_url, path, e)))
    }

    /// `GET /api/tags`
    pub async fn tags(&self) -> ServingResult<TagsResponse> {
        let path = "/api/tags";
        let response = self.http_client.get(self.url(path)?).send().await?;
        decode(path, response).await
    }

    /// `POST /api/embeddings`
    pub async fn embeddings(&self, request: &EmbeddingRequest) -> ServingResult<EmbeddingResponse> {
        self.post("/api/embeddings", request).await
    }

    /// `POST /api/chat` (non-streaming)
    pub async fn chat(&self, request: &ChatRequest) -> ServingResult<ChatResponse> {
        self.post("/api/chat", request).await
    }

    /// `POST /api/generate` (non-streaming)
    pub async fn generate(&self, request: &GenerateRequest) -> ServingResult<GenerateResponse> {
        self.post("/api/generate", request).await
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> ServingResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!(endpoint = %self.base_url, path = %path, "POST");
        let response = self
            .http_client
            .post(self.url(path)?)
            .json(body)
            .send()
            .await?;
        decode(path, response).await
    }

    /// Fail unless `model` appears in `/api/tags`.
    pub async fn ensure_model_listed(&self, model: &str) -> ServingResult<TagsResponse> {
        let tags = self.tags().await?;
        if !tags.contains(model) {
            return Err(ServingError::Validation(format!(
                "model {} not served; available: [{}]",
                model,
                tags.names().join(", ")
            )));
        }
        info!(model = %model, "Model is listed by the serving endpoint");
        Ok(tags)
    }

    /// Generate once and fail on an empty response.
    pub async fn ensure_generates(&self, request: &GenerateRequest) -> ServingResult<String> {
        let generated = self.generate(request).await?;
        if generated.response.trim().is_empty() {
            return Err(ServingError::Validation(format!(
                "model {} returned an empty response",
                request.model
            )));
        }
        Ok(generated.response)
    }

    /// Embed once and fail on an empty vector.
    pub async fn ensure_embeds(&self, request: &EmbeddingRequest) -> ServingResult<Vec<f32>> {
        let embedded = self.embeddings(request).await?;
        if embedded.embedding.is_empty() {
            return Err(ServingError::Validation(format!(
                "model {} returned an empty embedding",
                request.model
            )));
        }
        Ok(embedded.embedding)
    }
}

async fn decode<R: DeserializeOwned>(path: &str, response: reqwest::Response) -> ServingResult<R> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ServingError::Status {
            path: path.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| ServingError::Decode {
        path: path.to_string(),
        message: format!("{}: {}", e, body),
    })
}
