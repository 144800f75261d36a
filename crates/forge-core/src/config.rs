//! Configuration management for the Forge pipeline
//!
//! Loaded from `forge.toml` in the target repository root, falling back to
//! defaults. Every knob the orchestrator, retriever, gates, and risk scorer
//! consult lives here so a run is reproducible from its config.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::Severity;
use crate::{ForgeError, Result};

/// Pipeline-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum generation attempts per step before the step is rejected
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: usize,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub gates: GateConfig,

    #[serde(default)]
    pub risk: RiskWeights,

    #[serde(default)]
    pub test_first: TestFirstConfig,
}

/// Bounds on context retrieval, keeping downstream prompts bounded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
}

/// Provider call timeout and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Transient-failure retries per backend before falling over
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Gate policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Findings at or above this severity get the blocking flag
    #[serde(default = "default_blocking_threshold")]
    pub blocking_threshold: Severity,
}

/// Fixed weights for the risk score's weighted sum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    #[serde(default = "default_complexity_weight")]
    pub complexity: f32,

    #[serde(default = "default_findings_weight")]
    pub findings: f32,

    #[serde(default = "default_coverage_weight")]
    pub coverage: f32,

    #[serde(default = "default_history_weight")]
    pub history: f32,

    /// Score at or above this emits a pre-emptive rollback trigger
    #[serde(default = "default_high_risk_threshold")]
    pub high_risk_threshold: f32,
}

impl RiskWeights {
    /// Weighted sum of the normalized sub-scores, clamped to 0..=1
    pub fn combine(&self, complexity: f32, findings: f32, coverage: f32, history: f32) -> f32 {
        (self.complexity * complexity
            + self.findings * findings
            + self.coverage * coverage
            + self.history * history)
            .clamp(0.0, 1.0)
    }
}

/// Test-first generation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFirstConfig {
    #[serde(default = "default_test_first_enabled")]
    pub enabled: bool,

    /// Retries for a test that fails to compile or run before falling back
    /// to plain generation
    #[serde(default = "default_max_test_retries")]
    pub max_test_retries: usize,
}

// Default value providers

fn default_max_step_attempts() -> usize {
    3
}

fn default_max_context_bytes() -> usize {
    32 * 1024
}

fn default_max_fragments() -> usize {
    12
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_provider_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_blocking_threshold() -> Severity {
    Severity::Critical
}

fn default_complexity_weight() -> f32 {
    0.30
}

fn default_findings_weight() -> f32 {
    0.25
}

fn default_coverage_weight() -> f32 {
    0.30
}

fn default_history_weight() -> f32 {
    0.15
}

fn default_high_risk_threshold() -> f32 {
    0.75
}

fn default_test_first_enabled() -> bool {
    true
}

fn default_max_test_retries() -> usize {
    2
}

impl PipelineConfig {
    /// Load configuration from `forge.toml` in the given directory, or use
    /// defaults when no file exists
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join("forge.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| ForgeError::Config(format!("Failed to parse forge.toml: {}", e)))
        } else {
            tracing::debug!("No forge.toml at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Write default configuration to `forge.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_path = repo_root.join("forge.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ForgeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            context: ContextConfig::default(),
            provider: ProviderConfig::default(),
            gates: GateConfig::default(),
            risk: RiskWeights::default(),
            test_first: TestFirstConfig::default(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_context_bytes(),
            max_fragments: default_max_fragments(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_provider_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            blocking_threshold: default_blocking_threshold(),
        }
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            complexity: default_complexity_weight(),
            findings: default_findings_weight(),
            coverage: default_coverage_weight(),
            history: default_history_weight(),
            high_risk_threshold: default_high_risk_threshold(),
        }
    }
}

impl Default for TestFirstConfig {
    fn default() -> Self {
        Self {
            enabled: default_test_first_enabled(),
            max_test_retries: default_max_test_retries(),
        }
    }
}
