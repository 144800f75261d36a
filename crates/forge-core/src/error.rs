//! Unified error types for Forge

use thiserror::Error;
use uuid::Uuid;

/// Unified error type for all Forge operations
#[derive(Error, Debug)]
pub enum ForgeError {
    // Planning errors
    #[error("Planning failed: {0}")]
    Planning(String),

    // Provider errors
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Call timed out: {0}")]
    Timeout(String),

    // Generation errors
    #[error("Generation exhausted after {attempts} attempts: {reason}")]
    GenerationExhausted { attempts: usize, reason: String },

    // Gate errors
    #[error("Build tool invocation failed: {0}")]
    BuildTool(String),

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    // Record store errors
    #[error("Record store error: {0}")]
    Store(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Failure classification used by the orchestrator's retry policy
///
/// Fatal failures abort the execution immediately. Recoverable failures are
/// retried within the step's bounded attempt budget before the step is
/// downgraded to a rejected outcome. Blocking gate results are not errors at
/// all - gates return findings, and the orchestrator interprets the blocking
/// flag on those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Fatal,
    Recoverable,
}

impl ForgeError {
    /// Classify this error for the orchestrator's retry policy
    pub fn class(&self) -> FailureClass {
        match self {
            Self::ProviderUnavailable(_)
            | Self::RateLimited(_)
            | Self::InvalidResponse(_)
            | Self::Timeout(_)
            | Self::GenerationExhausted { .. }
            | Self::BuildTool(_)
            | Self::Analyzer(_) => FailureClass::Recoverable,

            Self::Planning(_)
            | Self::Store(_)
            | Self::ExecutionNotFound(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => FailureClass::Fatal,
        }
    }

    /// Whether the step-level retry loop may re-attempt after this error
    pub fn is_recoverable(&self) -> bool {
        self.class() == FailureClass::Recoverable
    }
}

/// Result type alias using ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;
