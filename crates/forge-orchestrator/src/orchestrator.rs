//! Execution driver
//!
//! Owns one `ExecutionRecord` per goal and is its sole writer. The driver
//! asks the planner for a plan, then walks the steps strictly in order,
//! feeding agent results into the per-step state machine and executing the
//! actions it returns. Security and build gates for an attempt run
//! concurrently; their results are recorded in gate order.
//!
//! Cancellation is cooperative: the flag is checked before each step and
//! before each generation attempt, and the in-flight attempt is never
//! interrupted mid-write.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use forge_agents::{
    BuildDoctor, BuildRunner, Planner, RiskAssessor, SecurityAnalyzer, StaticAnalysisTool,
    TestFirstAgent,
};
use forge_context::{ContextRetriever, RepositorySnapshot};
use forge_core::{
    ContextBundle, EventKind, ExecutionId, ExecutionRecord, ExecutionStatus, ForgeError,
    GateKind, Goal, Patch, PatchAttempt, PipelineConfig, RecordEvent, RejectReason, Result,
    Step, StepOutcome, TestArtifact,
};
use forge_provider::ProviderGateway;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::machine::{Action, StepEvent, StepMachine, StepState};
use crate::rollback::RollbackExecutor;
use crate::store::RecordStore;

/// How one step's run ended, from the driver's point of view
enum StepRun {
    Accepted,
    Rejected(RejectReason),
    Cancelled,
}

pub struct Orchestrator {
    planner: Planner,
    retriever: ContextRetriever,
    test_first: TestFirstAgent,
    security: SecurityAnalyzer,
    doctor: BuildDoctor,
    risk: RiskAssessor,
    snapshot: Arc<dyn RepositorySnapshot>,
    runner: Arc<dyn BuildRunner>,
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
    cancellations: RwLock<HashMap<ExecutionId, Arc<AtomicBool>>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<ProviderGateway>,
        snapshot: Arc<dyn RepositorySnapshot>,
        runner: Arc<dyn BuildRunner>,
        store: Arc<dyn RecordStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            planner: Planner::new(gateway.clone()),
            retriever: ContextRetriever::new(config.context.clone()),
            test_first: TestFirstAgent::new(gateway, config.test_first.clone()),
            security: SecurityAnalyzer::new(config.gates.clone()),
            doctor: BuildDoctor::new(),
            risk: RiskAssessor::new(config.risk.clone()),
            snapshot,
            runner,
            store,
            config,
            cancellations: RwLock::new(HashMap::new()),
        }
    }

    /// Plug an external static-analysis tool into the security gate
    pub fn with_analysis_tool(mut self, tool: Arc<dyn StaticAnalysisTool>) -> Self {
        self.security = self.security.with_tool(tool);
        self
    }

    /// Run a goal to completion and return the final record
    pub async fn execute(&self, goal: Goal) -> Result<ExecutionRecord> {
        let record = ExecutionRecord::new(goal);
        let id = record.execution_id;
        self.register(id).await;
        self.store.put(record.clone()).await?;

        let result = self.drive(record).await;
        self.cancellations.write().await.remove(&id);
        result
    }

    /// Start a goal on a background task and return its execution id
    ///
    /// Progress is observable through `status`; the task keeps the store
    /// updated at every step boundary.
    pub async fn spawn(self: &Arc<Self>, goal: Goal) -> Result<ExecutionId> {
        let record = ExecutionRecord::new(goal);
        let id = record.execution_id;
        self.register(id).await;
        self.store.put(record.clone()).await?;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.drive(record).await {
                error!("Execution {} aborted: {}", id, err);
            }
            orchestrator.cancellations.write().await.remove(&id);
        });

        Ok(id)
    }

    /// Latest stored snapshot of an execution's record
    pub async fn status(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.store.load(id).await
    }

    /// Request cooperative cancellation
    ///
    /// Takes effect at the next step boundary or generation attempt. A
    /// no-op for executions that already finished.
    pub async fn cancel(&self, id: ExecutionId) -> Result<()> {
        if let Some(flag) = self.cancellations.read().await.get(&id) {
            info!("Cancellation requested for execution {}", id);
            flag.store(true, Ordering::Relaxed);
            return Ok(());
        }
        // Known but finished executions accept the request silently
        self.store.load(id).await.map(|_| ())
    }

    /// Roll back an accepted step
    ///
    /// The step's record is upgraded to RolledBack and a compensating step
    /// is derived for the caller to execute as new forward work. History is
    /// only appended to, never rewritten.
    pub async fn apply_rollback(
        &self,
        execution_id: ExecutionId,
        step_id: forge_core::StepId,
        executor: &dyn RollbackExecutor,
    ) -> Result<Step> {
        let mut record = self.store.load(execution_id).await?;

        let (step, patch) = {
            let step_record = record.step_record(step_id).ok_or_else(|| {
                ForgeError::Other(format!("step {step_id} not part of execution {execution_id}"))
            })?;
            let attempt = step_record.latest_attempt().ok_or_else(|| {
                ForgeError::Other(format!("step {step_id} has no recorded patch"))
            })?;
            (step_record.step.clone(), attempt.patch.clone())
        };

        let upgraded = record
            .step_record_mut(step_id)
            .map(|s| s.mark_rolled_back())
            .unwrap_or(false);
        if !upgraded {
            return Err(ForgeError::Other(format!(
                "step {step_id} is not in the accepted state"
            )));
        }

        let compensating = executor.compensating_step(&step, &patch);
        record.push_event(RecordEvent::new(
            EventKind::RollbackApplied,
            Some(step_id),
            format!("compensating step {}: {}", compensating.id, compensating.description),
        ));
        self.store.put(record).await?;

        info!("Rolled back step {} of execution {}", step_id, execution_id);
        Ok(compensating)
    }

    async fn register(&self, id: ExecutionId) {
        self.cancellations
            .write()
            .await
            .insert(id, Arc::new(AtomicBool::new(false)));
    }

    async fn cancelled(&self, id: ExecutionId) -> bool {
        self.cancellations
            .read()
            .await
            .get(&id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    async fn drive(&self, mut record: ExecutionRecord) -> Result<ExecutionRecord> {
        let id = record.execution_id;
        info!("Executing goal: {}", record.goal.text);

        let plan = match self.planner.plan(&record.goal).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!("Planning failed for execution {}: {}", id, err);
                record.push_event(RecordEvent::new(
                    EventKind::ProviderError,
                    None,
                    err.to_string(),
                ));
                record.finish(ExecutionStatus::Failed(format!("planning: {err}")));
                self.store.put(record.clone()).await?;
                return Ok(record);
            }
        };

        record.accept_plan(plan.clone());
        self.store.put(record.clone()).await?;

        for step in plan.steps {
            if self.cancelled(id).await {
                record.push_event(RecordEvent::new(
                    EventKind::CancelRequested,
                    None,
                    "cancelled before next step",
                ));
                record.finish(ExecutionStatus::Cancelled);
                self.store.put(record.clone()).await?;
                return Ok(record);
            }

            let run = match self.run_step(&mut record, &step).await {
                Ok(run) => run,
                Err(err) => {
                    error!("Step {} aborted execution {}: {}", step.id, id, err);
                    if let Some(step_record) = record.step_record_mut(step.id) {
                        step_record
                            .finish(StepOutcome::Rejected(RejectReason::Internal(err.to_string())));
                    }
                    record.finish(ExecutionStatus::Failed(format!(
                        "step \"{}\": {err}",
                        step.description
                    )));
                    self.store.put(record.clone()).await?;
                    return Ok(record);
                }
            };
            self.store.put(record.clone()).await?;

            match run {
                StepRun::Accepted => {}
                StepRun::Cancelled => {
                    record.finish(ExecutionStatus::Cancelled);
                    self.store.put(record.clone()).await?;
                    return Ok(record);
                }
                StepRun::Rejected(reason) => {
                    record.finish(ExecutionStatus::Failed(format!(
                        "step \"{}\" rejected: {reason}",
                        step.description
                    )));
                    self.store.put(record.clone()).await?;
                    return Ok(record);
                }
            }
        }

        record.finish(ExecutionStatus::Completed);
        self.store.put(record.clone()).await?;
        info!("Execution {} completed", id);
        Ok(record)
    }

    async fn run_step(&self, record: &mut ExecutionRecord, step: &Step) -> Result<StepRun> {
        let id = record.execution_id;
        let machine = StepMachine::new(self.config.max_step_attempts);
        record.begin_step(step.clone());

        let mut bundle = ContextBundle::empty();
        let mut prior_failures: Vec<String> = Vec::new();

        let (mut state, start_actions) = machine.start();
        let mut queue: VecDeque<Action> = start_actions.into();

        while let Some(action) = queue.pop_front() {
            let events = match action {
                Action::RetrieveContext => {
                    bundle = self
                        .retriever
                        .retrieve(self.snapshot.as_ref(), &record.goal, step)
                        .await;
                    record.push_event(RecordEvent::new(
                        EventKind::ContextRetrieved,
                        Some(step.id),
                        format!(
                            "{} fragments, {} bytes",
                            bundle.fragments.len(),
                            bundle.total_bytes
                        ),
                    ));
                    vec![StepEvent::ContextReady]
                }

                Action::GeneratePatch(attempt) => {
                    if self.cancelled(id).await {
                        record.push_event(RecordEvent::new(
                            EventKind::CancelRequested,
                            Some(step.id),
                            format!("cancelled before attempt {attempt}"),
                        ));
                        if let Some(step_record) = record.step_record_mut(step.id) {
                            step_record.finish(StepOutcome::Rejected(RejectReason::Internal(
                                "cancelled".to_string(),
                            )));
                        }
                        return Ok(StepRun::Cancelled);
                    }

                    record.push_event(RecordEvent::new(
                        EventKind::AttemptStarted,
                        Some(step.id),
                        format!("attempt {attempt}"),
                    ));

                    match self
                        .test_first
                        .generate_validated(step, &bundle, &prior_failures, self.runner.as_ref())
                        .await
                    {
                        Ok((patch, artifact)) => {
                            let passed = test_gate_passed(step, &artifact);
                            record.push_event(RecordEvent::new(
                                EventKind::TestValidated,
                                Some(step.id),
                                format!(
                                    "post-patch {}/{} passed",
                                    artifact.post_patch.passed, artifact.post_patch.total
                                ),
                            ));

                            if !passed {
                                prior_failures.push(test_failure_summary(&artifact));
                            }

                            let mut patch_attempt = PatchAttempt::new(attempt, patch);
                            patch_attempt.test_artifact = Some(artifact);
                            if let Some(step_record) = record.step_record_mut(step.id) {
                                step_record.attempts.push(patch_attempt);
                            }

                            if passed {
                                vec![StepEvent::PatchReady(attempt), StepEvent::TestsPassed]
                            } else {
                                vec![StepEvent::PatchReady(attempt), StepEvent::TestsFailed]
                            }
                        }
                        Err(err) => {
                            record.push_event(RecordEvent::new(
                                EventKind::ProviderError,
                                Some(step.id),
                                err.to_string(),
                            ));

                            if !err.is_recoverable() {
                                if let Some(step_record) = record.step_record_mut(step.id) {
                                    step_record.finish(StepOutcome::Rejected(
                                        RejectReason::Internal(err.to_string()),
                                    ));
                                }
                                return Err(err);
                            }

                            if attempt < self.config.max_step_attempts {
                                // No patch was produced, so the machine is
                                // still in ContextRetrieved; schedule the
                                // next attempt directly
                                prior_failures.push(err.to_string());
                                record.push_event(RecordEvent::new(
                                    EventKind::RetryScheduled,
                                    Some(step.id),
                                    format!("attempt {}", attempt + 1),
                                ));
                                queue.push_back(Action::GeneratePatch(attempt + 1));
                                vec![]
                            } else {
                                vec![StepEvent::GenerationFailed]
                            }
                        }
                    }
                }

                Action::RunGates => {
                    let (patch, attempt_no) = latest_patch(record, step)?;
                    let security_needed = step.requires(GateKind::Security);
                    let build_needed = step.requires(GateKind::Build);

                    let (security_result, build_result) = tokio::join!(
                        async {
                            if security_needed {
                                self.security.analyze(&patch).await
                            } else {
                                Ok(Vec::new())
                            }
                        },
                        async {
                            if build_needed {
                                self.doctor.check(self.runner.as_ref(), &patch).await
                            } else {
                                Ok(Vec::new())
                            }
                        },
                    );

                    let gate_outcome = match (security_result, build_result) {
                        (Ok(security), Ok(build)) => Some((security, build)),
                        (Err(err), _) | (_, Err(err)) => {
                            record.push_event(RecordEvent::new(
                                EventKind::ProviderError,
                                Some(step.id),
                                format!("gate invocation failed: {err}"),
                            ));
                            if !err.is_recoverable() {
                                if let Some(step_record) = record.step_record_mut(step.id) {
                                    step_record.finish(StepOutcome::Rejected(
                                        RejectReason::Internal(err.to_string()),
                                    ));
                                }
                                return Err(err);
                            }
                            // A broken gate invocation consumes the attempt
                            // like a failed build would
                            prior_failures.push(format!("gate invocation failed: {err}"));
                            None
                        }
                    };
                    match gate_outcome {
                        None => vec![StepEvent::SecurityClean, StepEvent::BuildFailed],
                        Some((security_findings, build_findings)) => {
                            record.push_event(RecordEvent::new(
                                EventKind::GateCompleted,
                                Some(step.id),
                                format!("security: {} finding(s)", security_findings.len()),
                            ));
                            record.push_event(RecordEvent::new(
                                EventKind::GateCompleted,
                                Some(step.id),
                                format!("build: {} finding(s)", build_findings.len()),
                            ));

                            let blocked = security_findings.iter().any(|f| f.blocking);
                            let build_blocked = build_findings.iter().any(|f| f.blocking);
                            let build_clean = build_findings.is_empty();

                            // Feedback only helps when another attempt runs
                            if !build_clean && !build_blocked {
                                prior_failures.push(build_failure_summary(&build_findings));
                            }

                            if let Some(attempt) = record
                                .step_record_mut(step.id)
                                .and_then(|s| s.latest_attempt_mut())
                            {
                                attempt.findings.extend(security_findings);
                                attempt.findings.extend(build_findings);
                            }

                            debug!(
                                "Gates for step {} attempt {}: blocked={}, build_clean={}",
                                step.id, attempt_no, blocked, build_clean
                            );

                            if blocked {
                                vec![StepEvent::SecurityBlocked]
                            } else if build_blocked {
                                vec![StepEvent::SecurityClean, StepEvent::BuildBlocked]
                            } else if build_clean {
                                vec![StepEvent::SecurityClean, StepEvent::BuildClean]
                            } else {
                                vec![StepEvent::SecurityClean, StepEvent::BuildFailed]
                            }
                        }
                    }
                }

                Action::ScoreRisk => {
                    let (patch, _) = latest_patch(record, step)?;
                    let history = record.failure_rate();
                    let (artifact, findings) = {
                        let attempt = record
                            .step_record(step.id)
                            .and_then(|s| s.latest_attempt());
                        (
                            attempt.and_then(|a| a.test_artifact.clone()),
                            attempt.map(|a| a.findings.clone()).unwrap_or_default(),
                        )
                    };

                    let assessment =
                        self.risk
                            .assess(step, &patch, artifact.as_ref(), &findings, history);
                    record.push_event(RecordEvent::new(
                        EventKind::RiskScored,
                        Some(step.id),
                        format!("score {:.3}", assessment.score),
                    ));
                    if let Some(step_record) = record.step_record_mut(step.id) {
                        step_record.risk = Some(assessment);
                    }

                    vec![StepEvent::RiskReady, StepEvent::Accept]
                }

                Action::RecordOutcome => {
                    let outcome = match &state {
                        StepState::Accepted => StepOutcome::Accepted,
                        StepState::Rejected(reason) => StepOutcome::Rejected(reason.clone()),
                        StepState::RolledBack => StepOutcome::RolledBack,
                        other => StepOutcome::Rejected(RejectReason::Internal(format!(
                            "outcome recorded in non-terminal state {other:?}"
                        ))),
                    };
                    record.push_event(RecordEvent::new(
                        EventKind::StepFinished,
                        Some(step.id),
                        outcome.to_string(),
                    ));
                    if let Some(step_record) = record.step_record_mut(step.id) {
                        step_record.finish(outcome);
                    }
                    vec![]
                }

                // The driver halts the plan itself when the step run comes
                // back rejected
                Action::HaltPlan => vec![],
            };

            for event in events {
                let (next, actions) = machine.transition(state.clone(), event);
                for action in &actions {
                    if let Action::GeneratePatch(n) = action {
                        if *n > 1 {
                            record.push_event(RecordEvent::new(
                                EventKind::RetryScheduled,
                                Some(step.id),
                                format!("attempt {n}"),
                            ));
                        }
                    }
                }
                state = next;
                queue.extend(actions);
            }
        }

        match state {
            StepState::Accepted => Ok(StepRun::Accepted),
            StepState::Rejected(reason) => Ok(StepRun::Rejected(reason)),
            other => Err(ForgeError::Other(format!(
                "step {} ended in non-terminal state {other:?}",
                step.id
            ))),
        }
    }
}

fn test_gate_passed(step: &Step, artifact: &TestArtifact) -> bool {
    if !step.requires(GateKind::Test) {
        return true;
    }
    if artifact.test_code.is_empty() {
        // Fallback path ran the repository's existing suite; an empty
        // suite is not a failure
        artifact.post_patch.failed == 0
    } else {
        artifact.post_patch.all_passed()
    }
}

fn test_failure_summary(artifact: &TestArtifact) -> String {
    let output = artifact.post_patch.output.trim();
    let head: String = output.chars().take(300).collect();
    format!(
        "tests failed post-patch ({} of {} failed): {}",
        artifact.post_patch.failed, artifact.post_patch.total, head
    )
}

fn build_failure_summary(findings: &[forge_core::GateFinding]) -> String {
    findings
        .iter()
        .map(|f| match &f.proposed_fix {
            Some(fix) => format!("build: {} (try: {})", f.message, fix),
            None => format!("build: {}", f.message),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn latest_patch(record: &ExecutionRecord, step: &Step) -> Result<(Patch, usize)> {
    record
        .step_record(step.id)
        .and_then(|s| s.latest_attempt())
        .map(|a| (a.patch.clone(), a.attempt))
        .ok_or_else(|| {
            ForgeError::Other(format!("step {} has no patch attempt on record", step.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::ReverseDiffRollback;
    use crate::store::InMemoryRecordStore;
    use forge_agents::{failing_run, passing_run, ScriptedBuildRunner};
    use forge_context::InMemorySnapshot;
    use forge_core::{ProviderConfig, Severity};
    use forge_provider::{
        CompletionProvider, CompletionRequest, CompletionResponse, ProviderError,
        ScriptedProvider,
    };

    const PLAN_ONE_STEP: &str = "1. Add a greeting banner [risk: low] [gates: security,build,test]";
    const TEST_RESPONSE: &str = "```rust\n#[test]\nfn pins() { assert!(false); }\n```";
    const DIFF_RESPONSE: &str = "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1,2 @@\n pub fn f() {}\n+pub fn banner() {}\n```";
    const EVIL_DIFF_RESPONSE: &str =
        "```diff\n--- a/app.py\n+++ b/app.py\n@@ -1 +1,2 @@\n import os\n+result = eval(user_input)\n```";

    fn orchestrator_with(
        provider: ScriptedProvider,
        runner: ScriptedBuildRunner,
        config: PipelineConfig,
    ) -> Orchestrator {
        let gateway = ProviderGateway::new(
            vec![Arc::new(provider) as Arc<dyn CompletionProvider>],
            ProviderConfig::default(),
        );
        Orchestrator::new(
            Arc::new(gateway),
            Arc::new(InMemorySnapshot::new().with_file("src/lib.rs", "pub fn f() {}")),
            Arc::new(runner),
            Arc::new(InMemoryRecordStore::new()),
            config,
        )
    }

    fn happy_runner() -> ScriptedBuildRunner {
        ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
    }

    #[tokio::test]
    async fn test_single_step_accepted_with_one_attempt() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let orchestrator = orchestrator_with(provider, happy_runner(), PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].outcome(), Some(&StepOutcome::Accepted));
        assert_eq!(record.steps[0].attempts.len(), 1);
        assert!(record.steps[0].risk.is_some());

        let kinds: Vec<_> = record.events.iter().map(|e| e.kind.clone()).collect();
        assert!(kinds.contains(&EventKind::PlanAccepted));
        assert!(kinds.contains(&EventKind::StepStarted));
        assert!(kinds.contains(&EventKind::ContextRetrieved));
        assert!(kinds.contains(&EventKind::RiskScored));
        assert!(kinds.contains(&EventKind::StepFinished));
        assert!(!kinds.contains(&EventKind::RetryScheduled));
    }

    #[tokio::test]
    async fn test_blocking_finding_rejects_and_halts_plan() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer("1. Evaluate user input [risk: low]\n2. Never reached [risk: low]")
            .then_answer(TEST_RESPONSE)
            .then_answer(EVIL_DIFF_RESPONSE);
        let orchestrator = orchestrator_with(provider, happy_runner(), PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("evaluate user input", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        // The second step never started
        assert_eq!(record.steps.len(), 1);
        assert_eq!(
            record.steps[0].outcome(),
            Some(&StepOutcome::Rejected(RejectReason::BlockingFinding))
        );
        // Risk is never scored for a vetoed step
        assert!(record.steps[0].risk.is_none());

        let finding = &record.steps[0].attempts[0].findings[0];
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.blocking);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_rejects_step() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            // Three attempts: test generation then implementation, each time
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        // Generated tests fail pre-patch (good) but never pass post-patch
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(failing_run())
            .with_test_run(failing_run())
            .with_test_run(failing_run())
            .with_test_run(failing_run())
            .with_test_run(failing_run());
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        assert_eq!(
            record.steps[0].outcome(),
            Some(&StepOutcome::Rejected(RejectReason::GenerationExhausted))
        );
        assert_eq!(record.steps[0].attempts.len(), 3);

        let retries = record
            .events
            .iter()
            .filter(|e| e.kind == EventKind::RetryScheduled)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_unusable_responses_exhaust_generation() {
        // Planning parses, everything afterwards is prose: test generation
        // falls back, implementation never yields a diff
        let provider = ScriptedProvider::answering("scripted", "I have no idea.")
            .then_answer(PLAN_ONE_STEP);
        let orchestrator = orchestrator_with(
            provider,
            ScriptedBuildRunner::new(),
            PipelineConfig::default(),
        );

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        assert_eq!(
            record.steps[0].outcome(),
            Some(&StepOutcome::Rejected(RejectReason::GenerationExhausted))
        );
        assert!(record.steps[0].attempts.is_empty());
        assert!(record
            .events
            .iter()
            .any(|e| e.kind == EventKind::ProviderError));
    }

    #[tokio::test]
    async fn test_build_failure_retries_with_feedback() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_build(forge_agents::BuildOutput::failed(
                "error: cannot find crate `banner`",
            ));
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps[0].attempts.len(), 2);
        // First attempt carries the build finding, second is clean
        assert!(!record.steps[0].attempts[0].findings.is_empty());
        assert!(record.steps[0].attempts[1].findings.is_empty());
    }

    #[tokio::test]
    async fn test_gate_invocation_error_consumes_attempt() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        // The build gate's first invocation errors outright; the second
        // attempt builds clean
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_build_error();
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps[0].outcome(), Some(&StepOutcome::Accepted));
        assert_eq!(record.steps[0].attempts.len(), 2);

        assert!(record.events.iter().any(|e| e.kind == EventKind::ProviderError
            && e.detail.contains("gate invocation failed")));
        assert!(record
            .events
            .iter()
            .any(|e| e.kind == EventKind::RetryScheduled));
    }

    #[tokio::test]
    async fn test_repeated_gate_invocation_errors_exhaust_attempts() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_build_error()
            .with_build_error()
            .with_build_error();
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        assert_eq!(
            record.steps[0].outcome(),
            Some(&StepOutcome::Rejected(RejectReason::GenerationExhausted))
        );
        assert_eq!(record.steps[0].attempts.len(), 3);

        let gate_errors = record
            .events
            .iter()
            .filter(|e| e.kind == EventKind::ProviderError
                && e.detail.contains("gate invocation failed"))
            .count();
        assert_eq!(gate_errors, 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_build_break_rejects_step() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_build(forge_agents::BuildOutput::failed(
                "ld: internal error: aborting",
            ));
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        assert_eq!(
            record.steps[0].outcome(),
            Some(&StepOutcome::Rejected(RejectReason::BlockingFinding))
        );
        // No regeneration: the break is not attributable to the patch
        assert_eq!(record.steps[0].attempts.len(), 1);
        assert!(record.steps[0].risk.is_none());
    }

    #[tokio::test]
    async fn test_status_is_idempotent_after_completion() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let orchestrator = orchestrator_with(provider, happy_runner(), PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();
        let id = record.execution_id;

        let first = orchestrator.status(id).await.unwrap();
        let second = orchestrator.status(id).await.unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.status, ExecutionStatus::Completed);
    }

    /// Provider that answers from a script but parks on one call until
    /// released, so tests can interleave cancellation deterministically
    struct GatedProvider {
        inner: ScriptedProvider,
        park_on_call: usize,
        calls: std::sync::atomic::AtomicUsize,
        reached: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl CompletionProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.park_on_call {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.complete(request).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_step() {
        let reached = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let inner = ScriptedProvider::new("scripted")
            .then_answer("1. First change [risk: low]\n2. Second change [risk: low]\n3. Third change [risk: low]")
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        // Call 4 is the second step's test generation
        let provider = GatedProvider {
            inner,
            park_on_call: 4,
            calls: std::sync::atomic::AtomicUsize::new(0),
            reached: reached.clone(),
            release: release.clone(),
        };

        let gateway = ProviderGateway::new(
            vec![Arc::new(provider) as Arc<dyn CompletionProvider>],
            ProviderConfig::default(),
        );
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(gateway),
            Arc::new(InMemorySnapshot::new()),
            Arc::new(runner),
            Arc::new(InMemoryRecordStore::new()),
            PipelineConfig::default(),
        ));

        let id = orchestrator
            .spawn(Goal::new("three changes", "repo"))
            .await
            .unwrap();

        // Wait until step 2 is mid-generation, cancel, then let it finish
        reached.notified().await;
        orchestrator.cancel(id).await.unwrap();
        release.notify_one();

        // Poll until the background task lands the terminal status
        let record = loop {
            let record = orchestrator.status(id).await.unwrap();
            if record.status.is_terminal() {
                break record;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        assert_eq!(record.status, ExecutionStatus::Cancelled);
        // Step 2 finished its in-flight work; step 3 never started
        assert_eq!(record.steps.len(), 2);
        assert!(record
            .events
            .iter()
            .any(|e| e.kind == EventKind::CancelRequested));
    }

    #[tokio::test]
    async fn test_rollback_of_accepted_step() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let orchestrator = orchestrator_with(provider, happy_runner(), PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();
        let step_id = record.steps[0].step.id;

        let compensating = orchestrator
            .apply_rollback(record.execution_id, step_id, &ReverseDiffRollback)
            .await
            .unwrap();

        assert!(compensating.description.contains("Revert"));

        let updated = orchestrator.status(record.execution_id).await.unwrap();
        assert_eq!(
            updated.steps[0].outcome(),
            Some(&StepOutcome::RolledBack)
        );
        assert!(updated
            .events
            .iter()
            .any(|e| e.kind == EventKind::RollbackApplied));

        // A second rollback of the same step is refused
        assert!(orchestrator
            .apply_rollback(record.execution_id, step_id, &ReverseDiffRollback)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_finished_execution_is_noop() {
        let provider = ScriptedProvider::new("scripted")
            .then_answer(PLAN_ONE_STEP)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let orchestrator = orchestrator_with(provider, happy_runner(), PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("add a greeting banner", "repo"))
            .await
            .unwrap();

        assert!(orchestrator.cancel(record.execution_id).await.is_ok());
        let after = orchestrator.status(record.execution_id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_planning_failure_fails_execution() {
        let provider = ScriptedProvider::answering("scripted", "no numbered steps at all");
        let orchestrator = orchestrator_with(
            provider,
            ScriptedBuildRunner::new(),
            PipelineConfig::default(),
        );

        let record = orchestrator
            .execute(Goal::new("do something", "repo"))
            .await
            .unwrap();

        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
        assert!(record.steps.is_empty());
        assert!(record.plan.is_none());
    }

    #[tokio::test]
    async fn test_empty_goal_fails_cleanly() {
        let provider = ScriptedProvider::answering("scripted", PLAN_ONE_STEP);
        let orchestrator = orchestrator_with(
            provider,
            ScriptedBuildRunner::new(),
            PipelineConfig::default(),
        );

        let record = orchestrator.execute(Goal::new("", "repo")).await.unwrap();
        assert!(matches!(record.status, ExecutionStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_failure_rate_feeds_risk_history() {
        // Two steps: the first is rejected after exhausting attempts is
        // covered elsewhere; here both succeed and history stays clean
        let provider = ScriptedProvider::new("scripted")
            .then_answer("1. First [risk: low]\n2. Second [risk: low]")
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE)
            .then_answer(TEST_RESPONSE)
            .then_answer(DIFF_RESPONSE);
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run());
        let orchestrator = orchestrator_with(provider, runner, PipelineConfig::default());

        let record = orchestrator
            .execute(Goal::new("two changes", "repo"))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps.len(), 2);
        // Second step's risk saw a zero failure rate from the first
        let second_risk = record.steps[1].risk.as_ref().unwrap();
        let history = second_risk
            .factors
            .iter()
            .find(|f| f.name == "history")
            .unwrap();
        assert_eq!(history.value, 0.0);
    }
}
