//! Scripted completion backend for tests
//!
//! Answers from a canned queue and records every request it sees, so tests
//! can drive the gateway and the agents without a live backend.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{CompletionProvider, CompletionRequest, CompletionResponse, ProviderError};

/// Deterministic, scriptable `CompletionProvider`
pub struct ScriptedProvider {
    name: String,
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    /// Last scripted answer repeats once the queue drains
    fallback: Option<Result<String, ProviderError>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `text`
    pub fn answering(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut provider = Self::new(name);
        provider.fallback = Some(Ok(text.into()));
        provider
    }

    /// Always fails with `error`
    pub fn failing(name: impl Into<String>, error: ProviderError) -> Self {
        let mut provider = Self::new(name);
        provider.fallback = Some(Err(error));
        provider
    }

    /// Queue one successful answer ahead of the fallback
    pub fn then_answer(self, text: impl Into<String>) -> Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Ok(text.into()));
        }
        self
    }

    /// Queue one failure ahead of the fallback
    pub fn then_fail(self, error: ProviderError) -> Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Err(error));
        }
        self
    }

    /// Fail the first `count` calls with clones of `error`, then answer normally
    pub fn with_failures_before_success(self, count: u32, error: ProviderError) -> Self {
        if let Ok(mut queue) = self.responses.lock() {
            for _ in 0..count {
                queue.push_front(Err(error.clone()));
            }
        }
        self
    }

    /// Every request this provider has served, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let scripted = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .or_else(|| self.fallback.clone());

        match scripted {
            Some(Ok(text)) => Ok(CompletionResponse {
                text,
                provider: self.name.clone(),
            }),
            Some(Err(error)) => Err(error),
            None => Err(ProviderError::Unavailable(
                "scripted provider has no response queued".to_string(),
            )),
        }
    }
}
