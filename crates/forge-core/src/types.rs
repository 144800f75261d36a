//! Core type definitions for the Forge pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step identifier
pub type StepId = Uuid;

/// Execution identifier
pub type ExecutionId = Uuid;

/// The immutable input to one execution: a free-text objective plus a
/// repository reference and optional path hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    /// Free-text development objective
    pub text: String,
    /// Reference to the target repository snapshot
    pub repo_ref: String,
    /// Optional file/path hints to bias context retrieval
    pub path_hints: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(text: impl Into<String>, repo_ref: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            repo_ref: repo_ref.into(),
            path_hints: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_path_hints(mut self, hints: Vec<String>) -> Self {
        self.path_hints = hints;
        self
    }
}

/// Declared risk hint for a planned step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskHint {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "med" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid risk hint: {}", s)),
        }
    }
}

/// A validation stage that can block step acceptance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Security,
    Build,
    Test,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "security" => Ok(Self::Security),
            "build" => Ok(Self::Build),
            "test" | "tests" => Ok(Self::Test),
            _ => Err(format!("Invalid gate kind: {}", s)),
        }
    }
}

/// One unit of planned work within an execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Human-readable description of the change to make
    pub description: String,
    /// Planner-declared risk hint
    pub risk_hint: RiskHint,
    /// Gates that must clear before this step can be accepted
    pub required_gates: Vec<GateKind>,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            risk_hint: RiskHint::Low,
            required_gates: vec![GateKind::Security, GateKind::Build, GateKind::Test],
        }
    }

    pub fn with_risk_hint(mut self, hint: RiskHint) -> Self {
        self.risk_hint = hint;
        self
    }

    pub fn with_gates(mut self, gates: Vec<GateKind>) -> Self {
        self.required_gates = gates;
        self
    }

    pub fn requires(&self, gate: GateKind) -> bool {
        self.required_gates.contains(&gate)
    }
}

/// Ordered sequence of steps produced by the planner
///
/// Immutable once accepted by the orchestrator. Re-planning creates a new
/// plan with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            steps,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Byte range or symbol a context fragment covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentSpan {
    Bytes { start: usize, end: usize },
    Symbol(String),
    Whole,
}

/// One relevant slice of the repository, scored for a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFragment {
    pub path: String,
    pub span: FragmentSpan,
    pub score: f32,
    pub content: String,
}

/// Bounded set of context fragments for a single step
///
/// Produced fresh per step and never persisted beyond the step's lifetime.
/// An empty bundle is valid - generation can proceed on the step description
/// alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    pub fragments: Vec<ContextFragment>,
    pub total_bytes: usize,
}

impl ContextBundle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Render the bundle for inclusion in a generation prompt
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|f| format!("File: {}\n{}", f.path, f.content))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// A candidate change: unified diff plus generation metadata
///
/// Patches are immutable values. A rejected patch is discarded and
/// regeneration yields a new patch with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub id: Uuid,
    pub step_id: StepId,
    /// Unified diff text
    pub diff: String,
    /// Name of the provider backend that generated this patch
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

impl Patch {
    pub fn new(step_id: StepId, diff: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            diff: diff.into(),
            provider: provider.into(),
            created_at: Utc::now(),
        }
    }

    /// Paths touched by this diff, in order of appearance
    pub fn changed_files(&self) -> Vec<String> {
        self.diff
            .lines()
            .filter_map(|line| {
                line.strip_prefix("+++ b/")
                    .or_else(|| line.strip_prefix("+++ "))
            })
            .filter(|p| *p != "/dev/null")
            .map(|p| p.to_string())
            .collect()
    }

    pub fn lines_added(&self) -> usize {
        self.diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .count()
    }

    pub fn lines_removed(&self) -> usize {
        self.diff
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .count()
    }

    pub fn hunk_count(&self) -> usize {
        self.diff.lines().filter(|l| l.starts_with("@@")).count()
    }
}

/// Outcome of running a generated test set once
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRun {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub output: String,
}

impl TestRun {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total > 0
    }
}

/// Generated test code plus its execution results, owned by the step that
/// produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestArtifact {
    pub test_code: String,
    /// Run before the implementation patch was applied (expected to fail)
    pub pre_patch: TestRun,
    /// Run after the implementation patch was applied
    pub post_patch: TestRun,
    pub coverage_before: f32,
    pub coverage_after: f32,
}

impl TestArtifact {
    /// Coverage delta in percentage points; negative means coverage dropped
    pub fn coverage_delta(&self) -> f32 {
        self.coverage_after - self.coverage_before
    }
}

/// Finding severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Category of a gate finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    // Security
    DynamicExecution,
    ShellInjection,
    HardcodedCredentials,
    SqlInjection,
    UnsafeDeserialization,
    WeakCryptography,
    // Build
    MissingDependency,
    VersionConflict,
    MissingDeclaration,
    BuildFailure,
    Other(String),
}

impl std::fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DynamicExecution => write!(f, "dynamic_execution"),
            Self::ShellInjection => write!(f, "shell_injection"),
            Self::HardcodedCredentials => write!(f, "hardcoded_credentials"),
            Self::SqlInjection => write!(f, "sql_injection"),
            Self::UnsafeDeserialization => write!(f, "unsafe_deserialization"),
            Self::WeakCryptography => write!(f, "weak_cryptography"),
            Self::MissingDependency => write!(f, "missing_dependency"),
            Self::VersionConflict => write!(f, "version_conflict"),
            Self::MissingDeclaration => write!(f, "missing_declaration"),
            Self::BuildFailure => write!(f, "build_failure"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Location of a finding within the patched tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingLocation {
    pub path: String,
    pub line: Option<usize>,
}

/// Structured result from a security or build gate
///
/// A single blocking finding vetoes the step regardless of other gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFinding {
    pub gate: GateKind,
    pub severity: Severity,
    pub category: FindingCategory,
    pub location: Option<FindingLocation>,
    pub message: String,
    pub blocking: bool,
    /// CWE identifier where the category maps to one
    pub cwe: Option<String>,
    /// Mechanically derived fix diff, where one exists
    pub proposed_fix: Option<String>,
}

impl GateFinding {
    pub fn new(
        gate: GateKind,
        severity: Severity,
        category: FindingCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            severity,
            category,
            location: None,
            message: message.into(),
            blocking: false,
            cwe: None,
            proposed_fix: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>, line: Option<usize>) -> Self {
        self.location = Some(FindingLocation {
            path: path.into(),
            line,
        });
        self
    }

    pub fn with_cwe(mut self, cwe: impl Into<String>) -> Self {
        self.cwe = Some(cwe.into());
        self
    }

    pub fn with_proposed_fix(mut self, fix: impl Into<String>) -> Self {
        self.proposed_fix = Some(fix.into());
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

/// Kind of rollback trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Emitted by the risk assessor at acceptance time
    PreEmptive,
    /// Fired by external post-acceptance monitoring
    Monitoring,
}

/// Condition-action pair identifying when and how an accepted step should be
/// compensated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTrigger {
    pub kind: TriggerKind,
    pub condition: String,
    pub action: String,
}

/// One weighted contribution to the overall risk score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: f32,
    /// Normalized sub-score in 0..=1
    pub value: f32,
}

impl RiskFactor {
    pub fn contribution(&self) -> f32 {
        self.weight * self.value
    }
}

/// Aggregated risk signal for a step, computed once the gates have run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Overall score in 0..=1
    pub score: f32,
    pub factors: Vec<RiskFactor>,
    pub triggers: Vec<RollbackTrigger>,
    pub recommendations: Vec<String>,
}

impl RiskAssessment {
    pub fn is_high_risk(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

/// Why a step was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A gate returned a blocking finding
    BlockingFinding,
    /// Generation could not produce a passing implementation within the
    /// attempt budget
    GenerationExhausted,
    /// Internal failure, with detail
    Internal(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockingFinding => write!(f, "blocking_finding"),
            Self::GenerationExhausted => write!(f, "generation_exhausted"),
            Self::Internal(detail) => write!(f, "internal: {}", detail),
        }
    }
}

/// Final outcome of a step, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Accepted,
    Rejected(RejectReason),
    RolledBack,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected(reason) => write!(f, "rejected ({})", reason),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}
