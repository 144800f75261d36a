//! Patch generation
//!
//! Produces a candidate unified diff for one step. The prompt carries the
//! step description, the retrieved context bundle, and a summary of every
//! prior failed attempt so regeneration does not repeat the same mistake.

use std::sync::Arc;

use forge_core::{ContextBundle, ForgeError, Patch, Result, Step};
use forge_provider::{CompletionRequest, ProviderGateway, PromptKind};
use tracing::debug;

use crate::extract;

pub struct CodeGenerator {
    gateway: Arc<ProviderGateway>,
}

impl CodeGenerator {
    pub fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Generate a candidate patch for the step
    ///
    /// `prior_failures` holds one summary line per previous rejected
    /// attempt, oldest first.
    pub async fn generate(
        &self,
        step: &Step,
        bundle: &ContextBundle,
        prior_failures: &[String],
    ) -> Result<Patch> {
        let request = CompletionRequest::new(
            PromptKind::CodeGeneration,
            self.prompt_for(step, bundle, prior_failures),
        );
        let response = self.gateway.complete(&request).await?;

        let diff = extract::unified_diff(&response.text).ok_or_else(|| {
            ForgeError::InvalidResponse(format!(
                "no unified diff in response from {}",
                response.provider
            ))
        })?;

        let patch = Patch::new(step.id, diff, response.provider);
        debug!(
            "Generated patch {} for step {}: {} files, +{} -{}",
            patch.id,
            step.id,
            patch.changed_files().len(),
            patch.lines_added(),
            patch.lines_removed()
        );
        Ok(patch)
    }

    fn prompt_for(&self, step: &Step, bundle: &ContextBundle, prior_failures: &[String]) -> String {
        let mut prompt = format!(
            "Step: {}\n\n\
             Produce a unified diff implementing exactly this step and \
             nothing else. Answer with a single fenced ```diff block.\n",
            step.description
        );

        if !bundle.is_empty() {
            prompt.push_str("\nRepository context:\n");
            prompt.push_str(&bundle.render());
            prompt.push('\n');
        }

        if !prior_failures.is_empty() {
            prompt.push_str("\nEarlier attempts failed; do not repeat them:\n");
            for (i, failure) in prior_failures.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, failure));
            }
        }

        prompt
    }
}
