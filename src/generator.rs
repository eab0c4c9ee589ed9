//! Generator contract: produces one candidate answer per call under a
//! given sampling profile.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::model::{Passage, SamplingParams};

/// One generated answer, prior to being wrapped into a [`crate::model::Candidate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
}

/// `generate(question, contexts, sampling_params) -> {text}`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        contexts: &[Passage],
        params: &SamplingParams,
    ) -> Result<GeneratedAnswer>;
}

/// Runs a [`Generator`] call under a deadline, translating elapsed timeouts
/// into `Error::GenerationTimeout`.
pub async fn generate_with_timeout(
    generator: &dyn Generator,
    question: &str,
    contexts: &[Passage],
    params: &SamplingParams,
    call_timeout: Duration,
) -> Result<GeneratedAnswer> {
    match timeout(call_timeout, generator.generate(question, contexts, params)).await {
        Ok(result) => result,
        Err(_) => Err(Error::GenerationTimeout {
            duration_ms: call_timeout.as_millis() as u64,
        }),
    }
}

/// A deterministic generator for tests: produces text that varies with
/// `temperature` so downstream candidates differ — answer variance is what
/// gives the DPO gates something to discriminate on.
pub struct TemplateGenerator {
    /// Indices (0-based call order) that should fail with
    /// `GenerationRefused`, simulating a candidate that fails generation.
    refuse_indices: std::collections::HashSet<usize>,
    calls: std::sync::atomic::AtomicUsize,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self {
            refuse_indices: std::collections::HashSet::new(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn refusing(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.refuse_indices = indices.into_iter().collect();
        self
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for TemplateGenerator {
    async fn generate(
        &self,
        question: &str,
        contexts: &[Passage],
        params: &SamplingParams,
    ) -> Result<GeneratedAnswer> {
        use std::sync::atomic::Ordering;
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_indices.contains(&call_index) {
            return Err(Error::GenerationRefused(format!(
                "refused at call index {call_index}"
            )));
        }

        let context_summary = contexts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        // Vary the shape of the answer with temperature so heuristic scoring
        // (and the DPO gates that depend on it) see real variance rather
        // than near-identical candidates.
        let text = if params.temperature < 0.4 {
            format!("{context_summary} Therefore, regarding \"{question}\", the answer follows directly from the above.")
        } else if params.temperature < 0.85 {
            format!("In short: {question} relates to the following — {context_summary}")
        } else {
            format!("{question}? Perhaps, speculatively: {context_summary} (though this is less certain).")
        };

        Ok(GeneratedAnswer { text })
    }
}
