//! DPO candidate-pair selection: at most one preference pair per batch,
//! gated on score separation, minimum chosen quality, and (optionally)
//! rejecting a chosen answer that is a verbatim copy of its context.

use std::collections::HashSet;

use tracing::{info, instrument};

use crate::config::DpoGateConfig;
use crate::model::{DpoCandidate, DpoMetadata, DpoRecord, RetiredBatch, ScoredCandidateWithAnswer, SkipReason};

/// Outcome of attempting DPO selection for one retired batch.
#[derive(Debug, Clone)]
pub enum DpoOutcome {
    Emitted(DpoRecord),
    Skipped(SkipReason),
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// `true` if `chosen` is effectively a verbatim copy of any context
/// passage (token-Jaccard above `threshold`).
fn is_verbatim_copy(chosen: &str, contexts: &[crate::model::Passage], threshold: f64) -> bool {
    let chosen_tokens = tokenize(chosen);
    contexts
        .iter()
        .any(|p| jaccard(&chosen_tokens, &tokenize(&p.text)) >= threshold)
}

/// Selects a `(chosen, rejected)` pair from a retired batch's scored
/// candidates.
pub struct DpoSelector {
    config: DpoGateConfig,
}

impl DpoSelector {
    pub fn new(config: DpoGateConfig) -> Self {
        Self { config }
    }

    /// Selects a pair, or reports why none was emitted. A batch retired via
    /// deadline expiry reports `BatchTimedOut` in place of whatever other
    /// skip reason its candidates would otherwise produce, since the
    /// proximate cause of non-emission is that the batch never completed
    /// normally.
    #[instrument(skip(self, retired), fields(batch_id = %retired.batch_id))]
    pub fn select(&self, retired: &RetiredBatch) -> DpoOutcome {
        match self.select_inner(retired) {
            DpoOutcome::Skipped(_) if retired.timed_out => DpoOutcome::Skipped(SkipReason::BatchTimedOut),
            other => other,
        }
    }

    fn select_inner(&self, retired: &RetiredBatch) -> DpoOutcome {
        if retired.scored_candidates.len() < 2 {
            return DpoOutcome::Skipped(SkipReason::InsufficientCandidates);
        }

        // Sort by overall score descending; tie-break on higher
        // faithfulness, then lower candidate_index.
        let mut ranked: Vec<&ScoredCandidateWithAnswer> = retired.scored_candidates.iter().collect();
        ranked.sort_by(|a, b| {
            b.scored
                .overall
                .partial_cmp(&a.scored.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.scored
                        .faithfulness
                        .partial_cmp(&a.scored.faithfulness)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.candidate.candidate_index.cmp(&b.candidate.candidate_index))
        });

        let chosen = ranked.first().expect("len checked above");
        let rejected = ranked.last().expect("len checked above");

        if chosen.candidate.answer_id == rejected.candidate.answer_id {
            return DpoOutcome::Skipped(SkipReason::InsufficientCandidates);
        }

        let score_difference = chosen.scored.overall - rejected.scored.overall;
        if score_difference < self.config.min_score_diff {
            return DpoOutcome::Skipped(SkipReason::ScoreDiffTooSmall);
        }
        if chosen.scored.overall < self.config.min_chosen_score {
            return DpoOutcome::Skipped(SkipReason::ChosenScoreTooLow);
        }
        if self.config.enable_verbatim_gate
            && is_verbatim_copy(&chosen.candidate.text, &retired.contexts, self.config.verbatim_threshold)
        {
            return DpoOutcome::Skipped(SkipReason::ChosenIsVerbatim);
        }

        info!(score_difference, "emitting dpo pair");
        DpoOutcome::Emitted(DpoRecord {
            prompt: retired.question.clone(),
            chosen: DpoCandidate { text: chosen.candidate.text.clone(), score: chosen.scored.overall },
            rejected: DpoCandidate { text: rejected.candidate.text.clone(), score: rejected.scored.overall },
            score_difference,
            metadata: DpoMetadata {
                batch_id: retired.batch_id,
                chosen_index: chosen.candidate.candidate_index,
                rejected_index: rejected.candidate.candidate_index,
                created_at: chrono::Utc::now(),
            },
        })
    }
}
