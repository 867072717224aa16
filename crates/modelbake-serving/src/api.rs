//! Request and response shapes for the Ollama HTTP API.
//!
//! Only the fields needed for validation are modelled; unknown response
//! fields are ignored.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// `POST /api/embeddings`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// One chat turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// `POST /api/chat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    pub message: ChatMessage,
}

/// `POST /api/generate`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// Base64-encoded images for multimodal models.
    pub images: Vec<String>,
    pub stream: bool,
}

impl GenerateRequest {
    /// Non-streaming text generation with no images.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            images: Vec::new(),
            stream: false,
        }
    }

    /// Attach a raw image; it is base64-encoded for the wire.
    pub fn with_image_bytes(mut self, bytes: &[u8]) -> Self {
        self.images
            .push(base64::engine::general_purpose::STANDARD.encode(bytes));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateResponse {
    pub response: String,
}

/// Entry of `GET /api/tags`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelTag {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagsResponse {
    pub models: Vec<ModelTag>,
}

impl TagsResponse {
    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    /// Whether `model` is listed, accepting an implicit `:latest` tag.
    pub fn contains(&self, model: &str) -> bool {
        let with_tag = if model.contains(':') {
            model.to_string()
        } else {
            format!("{}:latest", model)
        };
        self.models
            .iter()
            .any(|m| m.name == model || m.name == with_tag)
    }
}
