//! Append-only execution record
//!
//! The record is the owning audit aggregate for one goal's run. The
//! orchestrator is its sole writer; every other component returns values to
//! the orchestrator rather than mutating shared state. Every transition,
//! retry, and error is appended so the audit trail reflects every attempt,
//! not just the final outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    ExecutionId, ExecutionPlan, GateFinding, Goal, Patch, RiskAssessment, Step, StepId,
    StepOutcome, TestArtifact,
};

/// Overall status of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Planning,
    Running,
    Completed,
    /// Failed with the user-visible reason: which step, which category
    Failed(String),
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed(_) | Self::Cancelled
        )
    }
}

/// Kind of audit event appended to the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanAccepted,
    StepStarted,
    ContextRetrieved,
    AttemptStarted,
    TestValidated,
    GateCompleted,
    RetryScheduled,
    ProviderError,
    RiskScored,
    StepFinished,
    RollbackApplied,
    CancelRequested,
}

/// One timestamped entry in the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub at: DateTime<Utc>,
    pub step_id: Option<StepId>,
    pub kind: EventKind,
    pub detail: String,
}

impl RecordEvent {
    pub fn new(kind: EventKind, step_id: Option<StepId>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            step_id,
            kind,
            detail: detail.into(),
        }
    }
}

/// One generation attempt: the patch plus everything measured against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchAttempt {
    /// 1-based attempt number within the step
    pub attempt: usize,
    pub patch: Patch,
    pub test_artifact: Option<TestArtifact>,
    pub findings: Vec<GateFinding>,
    pub started_at: DateTime<Utc>,
}

impl PatchAttempt {
    pub fn new(attempt: usize, patch: Patch) -> Self {
        Self {
            attempt,
            patch,
            test_artifact: None,
            findings: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn has_blocking_finding(&self) -> bool {
        self.findings.iter().any(|f| f.blocking)
    }
}

/// Everything recorded for one step of the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    /// Ordered patch attempts; the last one is the attempt that decided the
    /// outcome
    pub attempts: Vec<PatchAttempt>,
    pub risk: Option<RiskAssessment>,
    /// Immutable once set
    outcome: Option<StepOutcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            attempts: Vec::new(),
            risk: None,
            outcome: None,
            finished_at: None,
        }
    }

    pub fn outcome(&self) -> Option<&StepOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Record the final outcome. The first recorded outcome wins; later
    /// calls are ignored so history cannot be rewritten.
    pub fn finish(&mut self, outcome: StepOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
            self.finished_at = Some(Utc::now());
        }
    }

    /// Upgrade an accepted step to rolled-back. The only permitted outcome
    /// change; anything else stays immutable.
    pub fn mark_rolled_back(&mut self) -> bool {
        if matches!(self.outcome, Some(StepOutcome::Accepted)) {
            self.outcome = Some(StepOutcome::RolledBack);
            true
        } else {
            false
        }
    }

    pub fn latest_attempt(&self) -> Option<&PatchAttempt> {
        self.attempts.last()
    }

    pub fn latest_attempt_mut(&mut self) -> Option<&mut PatchAttempt> {
        self.attempts.last_mut()
    }

    pub fn has_open_blocking_finding(&self) -> bool {
        self.latest_attempt()
            .map(|a| a.has_blocking_finding())
            .unwrap_or(false)
    }
}

/// The append-only audit aggregate for one goal's full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub goal: Goal,
    pub plan: Option<ExecutionPlan>,
    pub steps: Vec<StepRecord>,
    pub status: ExecutionStatus,
    pub events: Vec<RecordEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(goal: Goal) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            goal,
            plan: None,
            steps: Vec::new(),
            status: ExecutionStatus::Planning,
            events: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Accept a plan. Only valid while still planning; the plan is never
    /// replaced afterwards.
    pub fn accept_plan(&mut self, plan: ExecutionPlan) {
        if self.plan.is_none() {
            self.push_event(RecordEvent::new(
                EventKind::PlanAccepted,
                None,
                format!("{} steps", plan.steps.len()),
            ));
            self.plan = Some(plan);
            self.status = ExecutionStatus::Running;
        }
    }

    pub fn push_event(&mut self, event: RecordEvent) {
        self.events.push(event);
    }

    /// Begin a step. Enforces the single-in-progress invariant: panics are
    /// avoided by refusing the append when a step is already open.
    pub fn begin_step(&mut self, step: Step) -> bool {
        if self.in_progress_step().is_some() {
            return false;
        }
        self.push_event(RecordEvent::new(
            EventKind::StepStarted,
            Some(step.id),
            step.description.clone(),
        ));
        self.steps.push(StepRecord::new(step));
        true
    }

    pub fn in_progress_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| !s.is_finished())
    }

    pub fn step_record(&self, step_id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step.id == step_id)
    }

    pub fn step_record_mut(&mut self, step_id: StepId) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.step.id == step_id)
    }

    /// Fraction of finished steps that were rejected, used as the historical
    /// failure-rate signal for risk scoring
    pub fn failure_rate(&self) -> Option<f32> {
        let finished: Vec<_> = self.steps.iter().filter(|s| s.is_finished()).collect();
        if finished.is_empty() {
            return None;
        }
        let rejected = finished
            .iter()
            .filter(|s| matches!(s.outcome(), Some(StepOutcome::Rejected(_))))
            .count();
        Some(rejected as f32 / finished.len() as f32)
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        if !self.status.is_terminal() {
            self.status = status;
            self.finished_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejectReason;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(Goal::new("add null check to function X", "repo-main"))
    }

    #[test]
    fn test_outcome_immutable_once_recorded() {
        let mut step_record = StepRecord::new(Step::new("do the thing"));
        step_record.finish(StepOutcome::Accepted);
        step_record.finish(StepOutcome::Rejected(RejectReason::BlockingFinding));

        assert_eq!(step_record.outcome(), Some(&StepOutcome::Accepted));
    }

    #[test]
    fn test_rollback_upgrade_only_from_accepted() {
        let mut accepted = StepRecord::new(Step::new("a"));
        accepted.finish(StepOutcome::Accepted);
        assert!(accepted.mark_rolled_back());
        assert_eq!(accepted.outcome(), Some(&StepOutcome::RolledBack));

        let mut rejected = StepRecord::new(Step::new("b"));
        rejected.finish(StepOutcome::Rejected(RejectReason::BlockingFinding));
        assert!(!rejected.mark_rolled_back());
        assert_eq!(
            rejected.outcome(),
            Some(&StepOutcome::Rejected(RejectReason::BlockingFinding))
        );
    }

    #[test]
    fn test_single_step_in_progress() {
        let mut record = record();
        record.accept_plan(ExecutionPlan::new(vec![]));

        assert!(record.begin_step(Step::new("first")));
        assert!(!record.begin_step(Step::new("second")));
        assert_eq!(record.steps.len(), 1);

        let step_id = record.steps[0].step.id;
        record
            .step_record_mut(step_id)
            .unwrap()
            .finish(StepOutcome::Accepted);
        assert!(record.begin_step(Step::new("second")));
    }

    #[test]
    fn test_plan_accepted_once() {
        let mut record = record();
        let plan = ExecutionPlan::new(vec![Step::new("only step")]);
        let plan_id = plan.id;
        record.accept_plan(plan);
        record.accept_plan(ExecutionPlan::new(vec![]));

        assert_eq!(record.plan.as_ref().unwrap().id, plan_id);
        assert_eq!(record.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_failure_rate() {
        let mut record = record();
        record.accept_plan(ExecutionPlan::new(vec![]));
        assert_eq!(record.failure_rate(), None);

        record.begin_step(Step::new("a"));
        let id = record.steps[0].step.id;
        record.step_record_mut(id).unwrap().finish(StepOutcome::Accepted);

        record.begin_step(Step::new("b"));
        let id = record.steps[1].step.id;
        record
            .step_record_mut(id)
            .unwrap()
            .finish(StepOutcome::Rejected(RejectReason::GenerationExhausted));

        assert!((record.failure_rate().unwrap() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut record = record();
        record.finish(ExecutionStatus::Cancelled);
        record.finish(ExecutionStatus::Completed);
        assert_eq!(record.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut record = record();
        let step = Step::new("add validation");
        let step_id = step.id;
        record.accept_plan(ExecutionPlan::new(vec![step.clone()]));
        record.begin_step(step);

        let patch = Patch::new(step_id, "--- a/f\n+++ b/f\n@@ -1 +1,2 @@\n+x\n", "heuristic");
        record
            .step_record_mut(step_id)
            .unwrap()
            .attempts
            .push(PatchAttempt::new(1, patch));
        record
            .step_record_mut(step_id)
            .unwrap()
            .finish(StepOutcome::Accepted);
        record.finish(ExecutionStatus::Completed);

        let json = serde_json::to_string(&record).unwrap();
        let restored: ExecutionRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.execution_id, record.execution_id);
        assert_eq!(restored.steps.len(), record.steps.len());
        assert_eq!(
            restored.steps[0].step.id,
            record.steps[0].step.id
        );
        assert_eq!(restored.steps[0].outcome(), Some(&StepOutcome::Accepted));
        assert_eq!(restored.events.len(), record.events.len());
    }
}
