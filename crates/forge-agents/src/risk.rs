//! Risk scoring
//!
//! Runs after the gates and folds their evidence into one score in 0..=1:
//! diff complexity, residual (non-blocking) finding mass, coverage movement,
//! and the execution's own failure history. The weighted sum and the
//! high-risk threshold come from `RiskWeights`; a score at or above the
//! threshold emits a pre-emptive rollback trigger alongside the assessment.

use forge_core::{
    GateFinding, Patch, RiskAssessment, RiskFactor, RiskHint, RiskWeights, RollbackTrigger,
    Severity, Step, TestArtifact, TriggerKind,
};
use tracing::debug;

/// Churn at or above this many changed lines scores full complexity
const FULL_COMPLEXITY_CHURN: f32 = 300.0;

/// Coverage loss (percentage points) that scores the full coverage factor
const FULL_COVERAGE_LOSS: f32 = 10.0;

pub struct RiskAssessor {
    weights: RiskWeights,
}

impl RiskAssessor {
    pub fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    pub fn assess(
        &self,
        step: &Step,
        patch: &Patch,
        artifact: Option<&TestArtifact>,
        findings: &[GateFinding],
        history_failure_rate: Option<f32>,
    ) -> RiskAssessment {
        let complexity = complexity_score(step, patch);
        let finding_mass = finding_score(findings);
        let coverage = coverage_score(artifact);
        let history = history_failure_rate.unwrap_or(0.0).clamp(0.0, 1.0);

        let score = self
            .weights
            .combine(complexity, finding_mass, coverage, history);

        let factors = vec![
            RiskFactor {
                name: "complexity".to_string(),
                weight: self.weights.complexity,
                value: complexity,
            },
            RiskFactor {
                name: "findings".to_string(),
                weight: self.weights.findings,
                value: finding_mass,
            },
            RiskFactor {
                name: "coverage".to_string(),
                weight: self.weights.coverage,
                value: coverage,
            },
            RiskFactor {
                name: "history".to_string(),
                weight: self.weights.history,
                value: history,
            },
        ];

        let mut triggers = Vec::new();
        if score >= self.weights.high_risk_threshold {
            triggers.push(RollbackTrigger {
                kind: TriggerKind::PreEmptive,
                condition: format!(
                    "regression observed in files touched by step {}",
                    step.id
                ),
                action: format!("apply compensating change for step {}", step.id),
            });
        }

        let recommendations = recommendations_for(&factors, findings, artifact);

        debug!(
            "Risk for step {}: {:.3} (complexity {:.2}, findings {:.2}, coverage {:.2}, history {:.2})",
            step.id, score, complexity, finding_mass, coverage, history
        );

        RiskAssessment {
            score,
            factors,
            triggers,
            recommendations,
        }
    }
}

/// Diff churn normalized against `FULL_COMPLEXITY_CHURN`, floored by the
/// planner's own risk hint
fn complexity_score(step: &Step, patch: &Patch) -> f32 {
    let churn = patch.lines_added() as f32
        + patch.lines_removed() as f32
        + 5.0 * patch.hunk_count() as f32
        + 10.0 * patch.changed_files().len() as f32;
    let from_churn = (churn / FULL_COMPLEXITY_CHURN).clamp(0.0, 1.0);

    let floor = match step.risk_hint {
        RiskHint::Low => 0.0,
        RiskHint::Medium => 0.3,
        RiskHint::High => 0.6,
    };

    from_churn.max(floor)
}

fn finding_score(findings: &[GateFinding]) -> f32 {
    findings
        .iter()
        .map(|f| match f.severity {
            Severity::Critical => 1.0,
            Severity::High => 0.7,
            Severity::Medium => 0.4,
            Severity::Low => 0.2,
            Severity::Info => 0.1,
        })
        .sum::<f32>()
        .clamp(0.0, 1.0)
}

/// Coverage loss scores up toward 1.0; gains score 0. No test evidence at
/// all is scored at the midpoint.
fn coverage_score(artifact: Option<&TestArtifact>) -> f32 {
    match artifact {
        Some(artifact) => {
            let delta = artifact.coverage_delta();
            if delta >= 0.0 {
                0.0
            } else {
                (-delta / FULL_COVERAGE_LOSS).clamp(0.0, 1.0)
            }
        }
        None => 0.5,
    }
}

fn recommendations_for(
    factors: &[RiskFactor],
    findings: &[GateFinding],
    artifact: Option<&TestArtifact>,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if factors.iter().any(|f| f.name == "complexity" && f.value > 0.6) {
        recommendations.push("split this step into smaller independent changes".to_string());
    }

    if !findings.is_empty() {
        recommendations.push(format!(
            "resolve {} open gate finding(s) before relying on this change",
            findings.len()
        ));
    }

    match artifact {
        Some(artifact) if artifact.coverage_delta() < 0.0 => {
            recommendations.push("add tests covering the changed lines".to_string());
        }
        None => {
            recommendations
                .push("no step-specific test evidence; review the change manually".to_string());
        }
        _ => {}
    }

    recommendations
}
