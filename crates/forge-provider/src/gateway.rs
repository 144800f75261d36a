//! Provider gateway: ordered fallback over completion backends
//!
//! Every AI call in the pipeline goes through here. The gateway walks its
//! backend list in order, wrapping each call in the configured timeout and
//! retrying transient failures with exponential backoff before falling over
//! to the next backend. Hard failures trip the backend's circuit breaker so
//! repeated offenders get skipped entirely until their cooldown elapses.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_core::{ForgeError, ProviderConfig, Result};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::provider::{CompletionProvider, CompletionRequest, CompletionResponse, ProviderError};

/// Call accounting kept per backend
#[derive(Debug, Clone, Default)]
pub struct GatewayCallStats {
    pub requests: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

impl GatewayCallStats {
    pub fn average_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.requests - self.failures) as f64 / self.requests as f64
        }
    }
}

struct Backend {
    provider: Arc<dyn CompletionProvider>,
    breaker: CircuitBreaker,
    stats: Mutex<GatewayCallStats>,
}

/// Ordered fallback chain over completion backends
pub struct ProviderGateway {
    backends: Vec<Backend>,
    config: ProviderConfig,
}

impl ProviderGateway {
    pub fn new(providers: Vec<Arc<dyn CompletionProvider>>, config: ProviderConfig) -> Self {
        let backends = providers
            .into_iter()
            .map(|provider| Backend {
                provider,
                breaker: CircuitBreaker::default(),
                stats: Mutex::new(GatewayCallStats::default()),
            })
            .collect();

        Self { backends, config }
    }

    /// Names of configured backends, in fallback order
    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.provider.name().to_string())
            .collect()
    }

    /// Call accounting per backend
    pub fn stats(&self) -> Vec<(String, GatewayCallStats)> {
        self.backends
            .iter()
            .map(|b| {
                let stats = b.stats.lock().map(|s| s.clone()).unwrap_or_default();
                (b.provider.name().to_string(), stats)
            })
            .collect()
    }

    /// Complete a request against the first backend that answers
    ///
    /// Transient errors (unavailable, rate limited, timeout) are retried on
    /// the same backend with exponential backoff, up to the configured retry
    /// cap. Invalid responses are not retried here - callers that want a
    /// second opinion issue a fresh request.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if self.backends.is_empty() {
            return Err(ForgeError::ProviderUnavailable(
                "no completion backends configured".to_string(),
            ));
        }

        let mut last_error = None;

        for backend in &self.backends {
            let name = backend.provider.name();

            if !backend.breaker.allows_call() {
                debug!("Skipping backend {}: circuit open", name);
                continue;
            }

            match self.call_backend(backend, request).await {
                Ok(response) => {
                    backend.breaker.record_success();
                    return Ok(response);
                }
                Err(err) => {
                    warn!("Backend {} failed: {}", name, err);
                    backend.breaker.record_failure();
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .map(ForgeError::from)
            .unwrap_or_else(|| {
                ForgeError::ProviderUnavailable("all completion backends skipped".to_string())
            }))
    }

    /// One backend, with per-call timeout and bounded transient retries
    async fn call_backend(
        &self,
        backend: &Backend,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError> {
        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        let mut backoff_ms = self.config.initial_backoff_ms;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();

            let outcome = match tokio::time::timeout(timeout, backend.provider.complete(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.config.call_timeout_secs)),
            };

            let latency_ms = started.elapsed().as_millis() as u64;
            if let Ok(mut stats) = backend.stats.lock() {
                stats.requests += 1;
                stats.total_latency_ms += latency_ms;
                if outcome.is_err() {
                    stats.failures += 1;
                }
            }

            match outcome {
                Ok(response) => {
                    debug!(
                        "Backend {} answered in {}ms (attempt {})",
                        backend.provider.name(),
                        latency_ms,
                        attempt
                    );
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt <= self.config.max_retries => {
                    debug!(
                        "Backend {} transient failure ({}), retrying in {}ms",
                        backend.provider.name(),
                        err,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
