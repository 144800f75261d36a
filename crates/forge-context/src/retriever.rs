//! Step-scoped context retrieval
//!
//! Scores every file in the snapshot against the step description, the goal
//! text, and the goal's path hints, then packs the best matches into a
//! bundle under the configured byte and fragment budgets. Scoring is token
//! overlap plus a small recency bonus taken from the snapshot's listing
//! order, with a lexical tie-break, so the same inputs always yield the
//! same bundle.

use std::collections::HashSet;
use std::path::Path;

use forge_core::{ContextBundle, ContextConfig, ContextFragment, FragmentSpan, Goal, Step};
use tracing::{debug, warn};

use crate::snapshot::RepositorySnapshot;

/// Kept well below a single token match so recency only orders files the
/// query scores equally
const RECENCY_WEIGHT: f32 = 0.5;

pub struct ContextRetriever {
    config: ContextConfig,
}

struct Candidate {
    path: String,
    score: f32,
}

impl ContextRetriever {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Build the context bundle for one step
    ///
    /// Best-effort: files that cannot be listed or read are skipped, and an
    /// empty bundle is returned rather than an error when nothing matches.
    pub async fn retrieve(
        &self,
        snapshot: &dyn RepositorySnapshot,
        goal: &Goal,
        step: &Step,
    ) -> ContextBundle {
        let files = match snapshot.list_files().await {
            Ok(files) => files,
            Err(err) => {
                warn!("Context retrieval skipped, snapshot listing failed: {}", err);
                return ContextBundle::empty();
            }
        };

        let query = query_tokens(goal, step);
        let total = files.len() as f32;
        let mut candidates: Vec<Candidate> = files
            .iter()
            .enumerate()
            .filter_map(|(index, path)| {
                let path_str = path.to_string_lossy().to_string();
                let base = score_path(&path_str, &query, &goal.path_hints);
                if base <= 0.0 {
                    return None;
                }
                // Snapshots list recently modified files first where the
                // backing store tracks it
                let recency = RECENCY_WEIGHT * (total - index as f32) / total;
                Some(Candidate {
                    path: path_str,
                    score: base + recency,
                })
            })
            .collect();

        // Highest score first; lexical order breaks ties so retrieval
        // stays deterministic across runs
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut bundle = ContextBundle::empty();
        for candidate in candidates {
            if bundle.fragments.len() >= self.config.max_fragments {
                break;
            }

            let remaining = self.config.max_bytes.saturating_sub(bundle.total_bytes);
            if remaining == 0 {
                break;
            }

            let content = match snapshot.read(Path::new(&candidate.path)).await {
                Ok(content) => content,
                Err(err) => {
                    debug!("Skipping {}: {}", candidate.path, err);
                    continue;
                }
            };

            let (content, span) = if content.len() > remaining {
                let end = floor_char_boundary(&content, remaining);
                if end == 0 {
                    continue;
                }
                (content[..end].to_string(), FragmentSpan::Bytes { start: 0, end })
            } else {
                (content, FragmentSpan::Whole)
            };

            bundle.total_bytes += content.len();
            bundle.fragments.push(ContextFragment {
                path: candidate.path,
                span,
                score: candidate.score,
                content,
            });
        }

        debug!(
            "Retrieved {} fragments ({} bytes) for step {}",
            bundle.fragments.len(),
            bundle.total_bytes,
            step.id
        );
        bundle
    }
}

fn query_tokens(goal: &Goal, step: &Step) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for source in [goal.text.as_str(), step.description.as_str()] {
        for token in tokenize(source) {
            tokens.insert(token);
        }
    }
    tokens
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
}

fn score_path(path: &str, query: &HashSet<String>, hints: &[String]) -> f32 {
    let mut score = 0.0;

    for token in tokenize(path) {
        if query.contains(&token) {
            score += 1.0;
        }
    }

    // An explicit hint from the goal outweighs any overlap match
    for hint in hints {
        if path.contains(hint.as_str()) {
            score += 10.0;
        }
    }

    score
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
