//! Goal decomposition
//!
//! Turns a free-text goal into an ordered `ExecutionPlan`. The planner asks
//! the gateway for a numbered step list with per-step risk hints and gate
//! requirements, and parses it strictly; a malformed response gets exactly
//! one fresh request before planning fails.

use std::str::FromStr;
use std::sync::Arc;

use forge_core::{ExecutionPlan, ForgeError, GateKind, Goal, Result, RiskHint, Step};
use forge_provider::{CompletionRequest, ProviderGateway, PromptKind};
use regex::Regex;
use tracing::{debug, warn};

pub struct Planner {
    gateway: Arc<ProviderGateway>,
    step_pattern: Regex,
    risk_pattern: Regex,
    gates_pattern: Regex,
}

impl Planner {
    pub fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self {
            gateway,
            step_pattern: Regex::new(r"^\s*\d+[.)]\s+(.+)$").unwrap(),
            risk_pattern: Regex::new(r"\[risk:\s*(\w+)\]").unwrap(),
            gates_pattern: Regex::new(r"\[gates:\s*([\w,\s]+)\]").unwrap(),
        }
    }

    /// Decompose a goal into an execution plan
    ///
    /// An empty goal fails immediately without a provider call.
    pub async fn plan(&self, goal: &Goal) -> Result<ExecutionPlan> {
        if goal.text.trim().is_empty() {
            return Err(ForgeError::Planning("goal text is empty".to_string()));
        }

        let request = CompletionRequest::new(PromptKind::Planning, self.prompt_for(goal));

        // One retry for a response that does not parse; transient provider
        // failures are already retried inside the gateway
        for attempt in 1..=2 {
            let response = self.gateway.complete(&request).await?;
            match self.parse_plan(&response.text) {
                Ok(plan) => {
                    debug!(
                        "Planned {} steps for goal (attempt {})",
                        plan.steps.len(),
                        attempt
                    );
                    return Ok(plan);
                }
                Err(err) if attempt == 1 => {
                    warn!("Plan response did not parse, requesting again: {}", err);
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("plan loop returns on second attempt")
    }

    fn prompt_for(&self, goal: &Goal) -> String {
        let hints = if goal.path_hints.is_empty() {
            String::new()
        } else {
            format!("Relevant paths: {}\n", goal.path_hints.join(", "))
        };

        format!(
            "Goal: {}\n{}\
             Decompose this goal into the smallest ordered sequence of \
             independently verifiable code changes.\n\
             Answer with one numbered line per step:\n\
             N. <description> [risk: low|medium|high] [gates: security,build,test]\n",
            goal.text, hints
        )
    }

    fn parse_plan(&self, text: &str) -> Result<ExecutionPlan> {
        let mut steps = Vec::new();

        for line in text.lines() {
            let Some(captures) = self.step_pattern.captures(line) else {
                continue;
            };
            let raw = captures[1].trim();

            let risk_hint = self
                .risk_pattern
                .captures(raw)
                .and_then(|c| RiskHint::from_str(&c[1]).ok())
                .unwrap_or_default();

            let gates = self
                .gates_pattern
                .captures(raw)
                .map(|c| {
                    c[1].split(',')
                        .filter_map(|g| GateKind::from_str(g.trim()).ok())
                        .collect::<Vec<_>>()
                })
                .filter(|g| !g.is_empty());

            let description = self
                .gates_pattern
                .replace(&self.risk_pattern.replace(raw, ""), "")
                .trim()
                .to_string();

            if description.is_empty() {
                return Err(ForgeError::Planning(format!("step with no description: {line:?}")));
            }

            let mut step = Step::new(description).with_risk_hint(risk_hint);
            if let Some(gates) = gates {
                step = step.with_gates(gates);
            }
            steps.push(step);
        }

        if steps.is_empty() {
            return Err(ForgeError::Planning(
                "response contained no numbered steps".to_string(),
            ));
        }

        Ok(ExecutionPlan::new(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::ProviderConfig;
    use forge_provider::ScriptedProvider;

    fn planner_with(provider: ScriptedProvider) -> Planner {
        let gateway = ProviderGateway::new(vec![Arc::new(provider)], ProviderConfig::default());
        Planner::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_parses_steps_with_hints_and_gates() {
        let planner = planner_with(ScriptedProvider::answering(
            "scripted",
            "1. Add input validation [risk: low] [gates: security,test]\n\
             2. Migrate the schema [risk: high] [gates: security,build,test]\n",
        ));

        let plan = planner.plan(&Goal::new("harden the API", "repo")).await.unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].description, "Add input validation");
        assert_eq!(plan.steps[0].risk_hint, RiskHint::Low);
        assert!(!plan.steps[0].requires(GateKind::Build));
        assert_eq!(plan.steps[1].risk_hint, RiskHint::High);
        assert!(plan.steps[1].requires(GateKind::Build));
    }

    #[tokio::test]
    async fn test_missing_annotations_get_defaults() {
        let planner = planner_with(ScriptedProvider::answering("scripted", "1. Fix the bug\n"));

        let plan = planner.plan(&Goal::new("fix it", "repo")).await.unwrap();

        assert_eq!(plan.steps[0].risk_hint, RiskHint::Low);
        // All three gates by default
        assert_eq!(plan.steps[0].required_gates.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_goal_fails_without_provider_call() {
        let provider = Arc::new(ScriptedProvider::answering("scripted", "1. anything"));
        let gateway = ProviderGateway::new(
            vec![provider.clone() as Arc<dyn forge_provider::CompletionProvider>],
            ProviderConfig::default(),
        );
        let planner = Planner::new(Arc::new(gateway));

        let err = planner.plan(&Goal::new("   ", "repo")).await.unwrap_err();
        assert!(matches!(err, ForgeError::Planning(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_response_retried_once() {
        let provider = ScriptedProvider::answering("scripted", "1. Do the thing")
            .then_answer("I cannot break this down.");
        let planner = planner_with(provider);

        let plan = planner.plan(&Goal::new("do the thing", "repo")).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_two_malformed_responses_fail() {
        let planner = planner_with(ScriptedProvider::answering("scripted", "no steps here"));

        let err = planner.plan(&Goal::new("goal", "repo")).await.unwrap_err();
        assert!(matches!(err, ForgeError::Planning(_)));
    }
}
