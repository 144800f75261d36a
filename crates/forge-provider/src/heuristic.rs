//! Deterministic fallback backend
//!
//! Always available, never rate limited. When no real inference backend is
//! configured (or every one of them is down) the gateway falls through to
//! this provider, which answers from templates keyed on the prompt kind.
//! The output is intentionally conservative: small plans, tiny annotated
//! diffs, skeleton tests. It exists so the pipeline stays exercisable
//! end-to-end without network access.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, PromptKind, ProviderError,
};

pub struct HeuristicProvider {
    path_pattern: Regex,
    goal_pattern: Regex,
}

impl HeuristicProvider {
    pub fn new() -> Self {
        Self {
            // Something that looks like a relative source path in the prompt
            path_pattern: Regex::new(r"(?m)\b([\w./-]+\.(?:rs|py|js|ts|go|java|rb|toml|json))\b")
                .unwrap(),
            goal_pattern: Regex::new(r"(?m)^(?:Goal|Step):\s*(.+)$").unwrap(),
        }
    }

    fn goal_line(&self, prompt: &str) -> String {
        self.goal_pattern
            .captures(prompt)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| {
                prompt
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("apply the requested change")
                    .trim()
                    .to_string()
            })
    }

    fn target_path(&self, prompt: &str) -> String {
        self.path_pattern
            .captures(prompt)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "src/lib.rs".to_string())
    }

    fn plan_for(&self, prompt: &str) -> String {
        let goal = self.goal_line(prompt);
        let lowered = goal.to_lowercase();

        // Keyword complexity split, mirroring how a reviewer would triage
        let involved = ["refactor", "migrate", "rewrite", "redesign", "overhaul"]
            .iter()
            .any(|k| lowered.contains(k));
        let risky = ["auth", "security", "payment", "crypto", "database", "schema"]
            .iter()
            .any(|k| lowered.contains(k));

        let impl_risk = if risky {
            "high"
        } else if involved {
            "medium"
        } else {
            "low"
        };

        if involved {
            format!(
                "1. Add tests pinning the current behavior of: {goal} [risk: low] [gates: test,build]\n\
                 2. Implement: {goal} [risk: {impl_risk}] [gates: security,build,test]\n\
                 3. Remove code made obsolete by: {goal} [risk: medium] [gates: build,test]\n"
            )
        } else {
            format!(
                "1. Implement: {goal} [risk: {impl_risk}] [gates: security,build,test]\n"
            )
        }
    }

    fn patch_for(&self, prompt: &str) -> String {
        let goal = self.goal_line(prompt);
        let path = self.target_path(prompt);
        format!(
            "```diff\n\
             --- a/{path}\n\
             +++ b/{path}\n\
             @@ -0,0 +1,3 @@\n\
             +// {goal}\n\
             +// TODO(heuristic): replace this placeholder with a real change\n\
             +\n\
             ```\n"
        )
    }

    fn test_for(&self, prompt: &str) -> String {
        let goal = self.goal_line(prompt);
        format!(
            "```rust\n\
             #[test]\n\
             fn test_expected_behavior() {{\n\
                 // {goal}\n\
                 assert!(false, \"behavior not implemented yet\");\n\
             }}\n\
             ```\n"
        )
    }
}

impl Default for HeuristicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for HeuristicProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        debug!("Heuristic completion for {:?} prompt", request.kind);

        let text = match request.kind {
            PromptKind::Planning => self.plan_for(&request.prompt),
            PromptKind::CodeGeneration => self.patch_for(&request.prompt),
            PromptKind::TestGeneration => self.test_for(&request.prompt),
        };

        Ok(CompletionResponse {
            text,
            provider: self.name().to_string(),
        })
    }
}
