//! modelbake-serving: Ollama HTTP API client
//!
//! Thin client used to check that a provisioned image actually serves its
//! model: list tags, embed, chat, generate.

pub mod api;
mod client;
mod error;

pub use api::{
    ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
    GenerateRequest, GenerateResponse, ModelTag, TagsResponse,
};
pub use client::{ServingClient, DEFAULT_REQUEST_TIMEOUT_SECS};
pub use error::{ServingError, ServingResult};
