//! # forge-provider
//!
//! Uniform interface to AI-completion backends for the Forge pipeline.
//!
//! Concrete inference backends are external collaborators; this crate only
//! defines the completion seam and the gateway that sits in front of it:
//! ordered fallback across backends, per-call timeouts, bounded retries with
//! exponential backoff, and a per-backend circuit breaker.

mod breaker;
mod gateway;
mod heuristic;
mod provider;
mod scripted;

pub use breaker::{BreakerState, CircuitBreaker};
pub use gateway::{GatewayCallStats, ProviderGateway};
pub use heuristic::HeuristicProvider;
pub use provider::{
    CompletionConstraints, CompletionProvider, CompletionRequest, CompletionResponse,
    ProviderError, PromptKind,
};
pub use scripted::ScriptedProvider;
