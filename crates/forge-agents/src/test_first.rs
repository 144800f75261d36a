//! Test-first generation
//!
//! Wraps plain patch generation in a test-first discipline: generate a test
//! that pins the desired behavior, confirm it fails against the unpatched
//! tree, then generate the implementation and re-run. A test that cannot be
//! made to run and fail for the right reason is regenerated a bounded
//! number of times before the agent falls back to plain generation against
//! the repository's existing suite.
//!
//! The agent reports what happened; judging the result against the step's
//! test gate is the orchestrator's call.

use std::sync::Arc;

use forge_core::{ContextBundle, Patch, Result, Step, TestArtifact, TestFirstConfig, TestRun};
use forge_provider::{CompletionRequest, ProviderGateway, PromptKind};
use tracing::{debug, warn};

use crate::build_doctor::BuildRunner;
use crate::codegen::CodeGenerator;
use crate::extract;

/// Empty test code passed to the runner means "run the repository's own
/// suite"; used on the fallback path.
const EXISTING_SUITE: &str = "";

pub struct TestFirstAgent {
    gateway: Arc<ProviderGateway>,
    generator: CodeGenerator,
    config: TestFirstConfig,
}

impl TestFirstAgent {
    pub fn new(gateway: Arc<ProviderGateway>, config: TestFirstConfig) -> Self {
        Self {
            generator: CodeGenerator::new(gateway.clone()),
            gateway,
            config,
        }
    }

    /// Generate a patch for the step along with its test evidence
    pub async fn generate_validated(
        &self,
        step: &Step,
        bundle: &ContextBundle,
        prior_failures: &[String],
        runner: &dyn BuildRunner,
    ) -> Result<(Patch, TestArtifact)> {
        if !self.config.enabled {
            return self.plain_generation(step, bundle, prior_failures, runner).await;
        }

        let Some((test_code, pre_patch)) = self.failing_test(step, bundle, runner).await? else {
            warn!(
                "No usable failing test for step {} after {} retries, falling back",
                step.id, self.config.max_test_retries
            );
            return self.plain_generation(step, bundle, prior_failures, runner).await;
        };

        let coverage_before = runner.coverage(None).await?;

        let patch = self.generator.generate(step, bundle, prior_failures).await?;
        let post_patch = runner.run_tests(&test_code, Some(&patch)).await?;
        let coverage_after = runner.coverage(Some(&patch)).await?;

        debug!(
            "Test-first for step {}: pre {}/{} failed, post {}/{} passed",
            step.id, pre_patch.failed, pre_patch.total, post_patch.passed, post_patch.total
        );

        Ok((
            patch,
            TestArtifact {
                test_code,
                pre_patch,
                post_patch,
                coverage_before,
                coverage_after,
            },
        ))
    }

    /// Produce a test that runs and fails against the unpatched tree
    ///
    /// `None` when the retry budget is spent without one.
    async fn failing_test(
        &self,
        step: &Step,
        bundle: &ContextBundle,
        runner: &dyn BuildRunner,
    ) -> Result<Option<(String, TestRun)>> {
        let mut feedback: Option<String> = None;

        for attempt in 0..=self.config.max_test_retries {
            let request = CompletionRequest::new(
                PromptKind::TestGeneration,
                self.test_prompt(step, bundle, feedback.as_deref()),
            );
            let response = self.gateway.complete(&request).await?;

            let Some(test_code) = extract::fenced_block(&response.text, "") else {
                debug!("Test response had no code fence (attempt {})", attempt + 1);
                feedback = Some("the previous answer contained no fenced code block".to_string());
                continue;
            };

            let run = runner.run_tests(&test_code, None).await?;

            if run.total == 0 {
                debug!("Generated test did not execute (attempt {})", attempt + 1);
                feedback = Some(format!(
                    "the previous test failed to run at all: {}",
                    truncate(&run.output, 400)
                ));
                continue;
            }

            if run.all_passed() {
                debug!("Generated test passed pre-patch (attempt {})", attempt + 1);
                feedback = Some(
                    "the previous test already passes without the change; it must fail until \
                     the step is implemented"
                        .to_string(),
                );
                continue;
            }

            return Ok(Some((test_code, run)));
        }

        Ok(None)
    }

    /// Generation without a step-specific test; the repository's existing
    /// suite still runs against the patch
    async fn plain_generation(
        &self,
        step: &Step,
        bundle: &ContextBundle,
        prior_failures: &[String],
        runner: &dyn BuildRunner,
    ) -> Result<(Patch, TestArtifact)> {
        let coverage_before = runner.coverage(None).await?;
        let patch = self.generator.generate(step, bundle, prior_failures).await?;
        let post_patch = runner.run_tests(EXISTING_SUITE, Some(&patch)).await?;
        let coverage_after = runner.coverage(Some(&patch)).await?;

        Ok((
            patch,
            TestArtifact {
                test_code: String::new(),
                pre_patch: TestRun::default(),
                post_patch,
                coverage_before,
                coverage_after,
            },
        ))
    }

    fn test_prompt(&self, step: &Step, bundle: &ContextBundle, feedback: Option<&str>) -> String {
        let mut prompt = format!(
            "Step: {}\n\n\
             Write a test that fails today and will pass once this step is \
             implemented. Answer with a single fenced code block.\n",
            step.description
        );

        if !bundle.is_empty() {
            prompt.push_str("\nRepository context:\n");
            prompt.push_str(&bundle.render());
            prompt.push('\n');
        }

        if let Some(feedback) = feedback {
            prompt.push_str(&format!("\nNote: {feedback}\n"));
        }

        prompt
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        text
    } else {
        let mut end = max;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_doctor::{failing_run, passing_run, ScriptedBuildRunner};
    use forge_core::ProviderConfig;
    use forge_provider::{CompletionProvider, ScriptedProvider};

    const TEST_RESPONSE: &str = "```rust\n#[test]\nfn pins_behavior() { assert!(false); }\n```";
    const DIFF_RESPONSE: &str =
        "```diff\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1,2 @@\n pub fn f() {}\n+pub fn g() {}\n```";

    fn agent_with(
        provider: ScriptedProvider,
        config: TestFirstConfig,
    ) -> (TestFirstAgent, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let gateway = ProviderGateway::new(
            vec![provider.clone() as Arc<dyn CompletionProvider>],
            ProviderConfig::default(),
        );
        (TestFirstAgent::new(Arc::new(gateway), config), provider)
    }

    #[tokio::test]
    async fn test_happy_path_produces_artifact() {
        let (agent, _) = agent_with(
            ScriptedProvider::new("scripted")
                .then_answer(TEST_RESPONSE)
                .then_answer(DIFF_RESPONSE),
            TestFirstConfig::default(),
        );
        let runner = ScriptedBuildRunner::new()
            .with_test_run(failing_run())
            .with_test_run(passing_run())
            .with_coverage(75.0)
            .with_coverage(81.0);

        let step = Step::new("add g()");
        let (patch, artifact) = agent
            .generate_validated(&step, &ContextBundle::empty(), &[], &runner)
            .await
            .unwrap();

        assert_eq!(patch.step_id, step.id);
        assert!(artifact.test_code.contains("pins_behavior"));
        assert!(!artifact.pre_patch.all_passed());
        assert!(artifact.post_patch.all_passed());
        assert!((artifact.coverage_delta() - 6.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_prematurely_passing_test_is_regenerated() {
        let (agent, provider) = agent_with(
            ScriptedProvider::new("scripted")
                .then_answer(TEST_RESPONSE)
                .then_answer(TEST_RESPONSE)
                .then_answer(DIFF_RESPONSE),
            TestFirstConfig::default(),
        );
        // First generated test passes pre-patch (useless), second fails
        let runner = ScriptedBuildRunner::new()
            .with_test_run(passing_run())
            .with_test_run(failing_run())
            .with_test_run(passing_run());

        let step = Step::new("add g()");
        agent
            .generate_validated(&step, &ContextBundle::empty(), &[], &runner)
            .await
            .unwrap();

        let kinds: Vec<_> = provider.requests().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PromptKind::TestGeneration,
                PromptKind::TestGeneration,
                PromptKind::CodeGeneration
            ]
        );
        // The retry prompt explains what was wrong
        assert!(provider.requests()[1].prompt.contains("already passes"));
    }

    #[tokio::test]
    async fn test_unrunnable_test_falls_back_to_plain_generation() {
        let (agent, provider) = agent_with(
            ScriptedProvider::new("scripted")
                .then_answer(TEST_RESPONSE)
                .then_answer(TEST_RESPONSE)
                .then_answer(DIFF_RESPONSE),
            TestFirstConfig {
                enabled: true,
                max_test_retries: 1,
            },
        );
        let broken = TestRun {
            passed: 0,
            failed: 0,
            total: 0,
            output: "syntax error in test".to_string(),
        };
        let runner = ScriptedBuildRunner::new()
            .with_test_run(broken.clone())
            .with_test_run(broken)
            .with_test_run(passing_run());

        let step = Step::new("add g()");
        let (_, artifact) = agent
            .generate_validated(&step, &ContextBundle::empty(), &[], &runner)
            .await
            .unwrap();

        // Fallback: no step-specific test, existing suite ran post-patch
        assert!(artifact.test_code.is_empty());
        assert_eq!(artifact.pre_patch.total, 0);
        assert!(artifact.post_patch.all_passed());
        assert_eq!(provider.requests().last().map(|r| r.kind), Some(PromptKind::CodeGeneration));
    }

    #[tokio::test]
    async fn test_disabled_skips_test_generation() {
        let (agent, provider) = agent_with(
            ScriptedProvider::answering("scripted", DIFF_RESPONSE),
            TestFirstConfig {
                enabled: false,
                max_test_retries: 2,
            },
        );
        let runner = ScriptedBuildRunner::new();

        let step = Step::new("add g()");
        agent
            .generate_validated(&step, &ContextBundle::empty(), &[], &runner)
            .await
            .unwrap();

        assert!(provider
            .requests()
            .iter()
            .all(|r| r.kind == PromptKind::CodeGeneration));
    }
}
