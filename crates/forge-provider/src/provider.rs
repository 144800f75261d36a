//! Completion provider seam
//!
//! `Complete(prompt, constraints) -> text`, with the error taxonomy the
//! gateway's retry policy is written against.

use async_trait::async_trait;
use forge_core::ForgeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of completion a prompt is asking for
///
/// Backends are free to ignore this; the deterministic heuristic provider
/// dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Planning,
    CodeGeneration,
    TestGeneration,
}

/// Constraints applied to a single completion call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConstraints {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl Default for CompletionConstraints {
    fn default() -> Self {
        Self {
            max_tokens: Some(4096),
            temperature: Some(0.1),
        }
    }
}

/// A single completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub kind: PromptKind,
    pub prompt: String,
    pub constraints: CompletionConstraints,
}

impl CompletionRequest {
    pub fn new(kind: PromptKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            constraints: CompletionConstraints::default(),
        }
    }
}

/// A completion result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    /// Name of the backend that produced this response
    pub provider: String,
}

/// Error taxonomy for a completion backend
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Backend cannot be reached or refused the request outright
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Backend asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Backend answered, but the payload is unusable
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The per-call timeout elapsed
    #[error("call timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    /// Transient errors are eligible for retry on the same backend;
    /// the rest fall straight over to the next backend in the chain.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}

impl From<ProviderError> for ForgeError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => ForgeError::ProviderUnavailable(msg),
            ProviderError::RateLimited(msg) => ForgeError::RateLimited(msg),
            ProviderError::InvalidResponse(msg) => ForgeError::InvalidResponse(msg),
            ProviderError::Timeout(secs) => {
                ForgeError::Timeout(format!("provider call after {}s", secs))
            }
        }
    }
}

/// A single completion backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable backend name, recorded on every patch it generates
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}
