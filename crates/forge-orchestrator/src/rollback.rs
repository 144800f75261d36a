//! Post-acceptance compensation
//!
//! Rollback never rewrites history: the original step keeps its record and
//! is upgraded from Accepted to RolledBack, and a compensating step is
//! derived for the caller to execute as new forward work.

use forge_core::{GateKind, Patch, RiskHint, Step};

/// Derives the compensating step for an accepted patch
pub trait RollbackExecutor: Send + Sync {
    fn compensating_step(&self, step: &Step, patch: &Patch) -> Step;
}

/// Default executor: revert by reversing the accepted diff
pub struct ReverseDiffRollback;

impl ReverseDiffRollback {
    /// Reverse a unified diff: swap the file headers and flip added and
    /// removed lines
    pub fn reversed_diff(patch: &Patch) -> String {
        patch
            .diff
            .lines()
            .map(|line| {
                if let Some(rest) = line.strip_prefix("--- a/") {
                    format!("+++ b/{rest}")
                } else if let Some(rest) = line.strip_prefix("+++ b/") {
                    format!("--- a/{rest}")
                } else if line.starts_with("@@") {
                    line.to_string()
                } else if let Some(rest) = line.strip_prefix('+') {
                    format!("-{rest}")
                } else if let Some(rest) = line.strip_prefix('-') {
                    format!("+{rest}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }
}

impl RollbackExecutor for ReverseDiffRollback {
    fn compensating_step(&self, step: &Step, patch: &Patch) -> Step {
        let files = patch.changed_files().join(", ");
        Step::new(format!(
            "Revert \"{}\" (restore {})",
            step.description, files
        ))
        // Reverting is mechanical; the security gate has nothing new to say
        .with_risk_hint(RiskHint::Low)
        .with_gates(vec![GateKind::Build, GateKind::Test])
    }
}
