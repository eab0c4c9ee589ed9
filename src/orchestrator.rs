//! Orchestrator: receives a question, drives retrieval and generation,
//! publishes `answer.generated` events, and replies synchronously with the
//! candidate list plus correlation/batch IDs.
//!
//! The orchestrator is the only producer of `answer.generated` and is the
//! authority on `expected_count` — it reflects the post-drop candidate
//! count after any generator failures.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::aggregator::BatchAggregator;
use crate::bus::{EventBus, SharedEventBus};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::generator::{generate_with_timeout, Generator};
use crate::model::{AnswerGeneratedPayload, Batch, Candidate, EventEnvelope, EventType, Passage, SamplingParams};
use crate::retriever::{Retriever, RetryingRetriever};

/// One candidate as surfaced to the synchronous `ask_multi` caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub candidate_index: usize,
    pub text: String,
    pub answer_id: Uuid,
    pub sampling_params: SamplingParams,
}

impl From<&Candidate> for CandidateSummary {
    fn from(candidate: &Candidate) -> Self {
        Self {
            candidate_index: candidate.candidate_index,
            text: candidate.text.clone(),
            answer_id: candidate.answer_id,
            sampling_params: candidate.sampling_params.clone(),
        }
    }
}

/// The synchronous response to `ask_multi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskMultiResponse {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub candidates: Vec<CandidateSummary>,
}

/// Drives one question through retrieval, generation, and candidate
/// publication. Holds no per-request state; a fresh `Batch` is minted on
/// every `ask_multi` call.
pub struct Orchestrator<R: Retriever, G: Generator> {
    retriever: RetryingRetriever<R>,
    generator: G,
    bus: SharedEventBus,
    aggregator: Arc<BatchAggregator>,
    config: PipelineConfig,
}

impl<R: Retriever, G: Generator> Orchestrator<R, G> {
    /// Wraps `retriever` in [`RetryingRetriever`] (capped exponential
    /// backoff, `retrieval_timeout` per attempt) so every call the
    /// orchestrator makes survives transient `RetrievalUnavailable` errors
    /// without the caller needing to compose retries itself.
    pub fn new(retriever: R, generator: G, bus: SharedEventBus, aggregator: Arc<BatchAggregator>, config: PipelineConfig) -> Self {
        let retriever = RetryingRetriever::new(retriever).with_timeout(config.retrieval_timeout);
        Self {
            retriever,
            generator,
            bus,
            aggregator,
            config,
        }
    }

    /// `ask_multi(question, num_candidates) -> {batch_id, correlation_id, candidates[]}`.
    ///
    /// 1. Mints `correlation_id`/`batch_id`.
    /// 2. Retrieves contexts.
    /// 3. Calls the generator once per sampling profile, dropping failed
    ///    slots (the batch's `expected_count` reflects survivors only).
    /// 4. Registers the batch with the aggregator and publishes one
    ///    `answer.generated` event per surviving candidate.
    /// 5. Returns the candidate list synchronously; downstream scoring and
    ///    aggregation proceed asynchronously over the bus.
    #[instrument(skip(self, question), fields(correlation_id, batch_id))]
    pub async fn ask_multi(&self, question: &str, num_candidates: usize) -> Result<AskMultiResponse> {
        let correlation_id = Uuid::new_v4();
        tracing::Span::current().record("correlation_id", correlation_id.to_string().as_str());
        info!(num_candidates, "ask_multi: starting");

        let contexts = self.retrieve_contexts(question, correlation_id).await?;

        let batch_timeout = chrono::Duration::milliseconds(self.config.aggregator.batch_timeout.as_millis() as i64);
        let mut batch = Batch::new(correlation_id, question, contexts.clone(), num_candidates, batch_timeout)?;
        tracing::Span::current().record("batch_id", batch.batch_id.to_string().as_str());

        for index in 0..batch.expected_count {
            let params = self.config.generation.params_for(index);
            match generate_with_timeout(
                &self.generator,
                question,
                &contexts,
                &params,
                self.config.generation.generation_timeout,
            )
            .await
            {
                Ok(answer) => batch.candidates.push(Candidate::new(index, answer.text, params)),
                Err(e) => {
                    warn!(correlation_id = %correlation_id, candidate_index = index, error = %e, "dropping candidate slot");
                }
            }
        }

        let expected_count = batch.candidates.len();

        if expected_count == 0 {
            warn!(correlation_id = %correlation_id, "all candidate slots failed generation");
            return Ok(AskMultiResponse {
                batch_id: batch.batch_id,
                correlation_id,
                candidates: Vec::new(),
            });
        }

        self.aggregator
            .open_batch(batch.batch_id, correlation_id, batch.question.clone(), batch.contexts.clone(), expected_count)
            .await?;

        for candidate in &batch.candidates {
            let payload = AnswerGeneratedPayload {
                candidate_index: candidate.candidate_index,
                answer_id: candidate.answer_id,
                expected_count,
                question: batch.question.clone(),
                answer: candidate.text.clone(),
                contexts: batch.contexts.clone(),
                sampling_params: candidate.sampling_params.clone(),
            };
            let envelope = EventEnvelope::answer_generated(correlation_id, batch.batch_id, payload);
            match timeout(
                self.config.publish_timeout,
                self.bus.publish(EventType::AnswerGenerated.topic(), &batch.batch_id.to_string(), envelope),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(correlation_id = %correlation_id, batch_id = %batch.batch_id, error = %e, "failed to publish answer.generated"),
                Err(_) => warn!(correlation_id = %correlation_id, batch_id = %batch.batch_id, "publish timed out"),
            }
        }

        info!(correlation_id = %correlation_id, batch_id = %batch.batch_id, expected_count, "ask_multi: published candidates");

        Ok(AskMultiResponse {
            batch_id: batch.batch_id,
            correlation_id,
            candidates: batch.candidates.iter().map(CandidateSummary::from).collect(),
        })
    }

    /// Retrieves context passages through the retry-wrapped retriever
    /// (capped exponential backoff over `RetrievalUnavailable`); a final
    /// exhausted failure surfaces directly to the caller.
    async fn retrieve_contexts(&self, question: &str, correlation_id: Uuid) -> Result<Vec<Passage>> {
        self.retriever.retrieve(question, self.config.retrieval_k).await.map_err(|e| {
            warn!(correlation_id = %correlation_id, error = %e, "retrieval failed after retries exhausted");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::generator::TemplateGenerator;
    use crate::model::EventPayload;
    use crate::retriever::InMemoryRetriever;

    fn corpus() -> Vec<Passage> {
        vec![
            Passage { text: "A load balancer distributes network traffic across servers".into(), source_id: "a".into(), score: 0.0 },
            Passage { text: "Load balancers improve availability and throughput".into(), source_id: "b".into(), score: 0.0 },
        ]
    }

    fn harness(generator: TemplateGenerator) -> (Orchestrator<InMemoryRetriever, TemplateGenerator>, Arc<InMemoryEventBus>) {
        let config = PipelineConfig::default();
        let bus = Arc::new(InMemoryEventBus::from_config(&config));
        let shared: SharedEventBus = bus.clone();
        let (aggregator, _rx) = BatchAggregator::new(shared.clone(), config.aggregator.clone());
        let orchestrator = Orchestrator::new(InMemoryRetriever::new(corpus()), generator, shared, aggregator, config);
        (orchestrator, bus)
    }

    #[tokio::test]
    async fn publishes_one_event_per_surviving_candidate() {
        let (orchestrator, bus) = harness(TemplateGenerator::new());
        let mut rx = bus.subscribe("answer.generated", "test").await.unwrap();

        let response = orchestrator.ask_multi("What is a load balancer?", 3).await.unwrap();
        assert_eq!(response.candidates.len(), 3);

        for _ in 0..3 {
            let envelope = rx.recv().await.unwrap();
            let EventPayload::AnswerGenerated(payload) = envelope.payload else { panic!("wrong payload") };
            assert_eq!(payload.expected_count, 3);
            assert_eq!(envelope.batch_id, response.batch_id);
            assert_eq!(envelope.correlation_id, response.correlation_id);
        }
    }

    #[tokio::test]
    async fn dropped_candidate_reduces_expected_count() {
        let (orchestrator, bus) = harness(TemplateGenerator::new().refusing([1]));
        let mut rx = bus.subscribe("answer.generated", "test").await.unwrap();

        let response = orchestrator.ask_multi("What is a load balancer?", 3).await.unwrap();
        assert_eq!(response.candidates.len(), 2);

        for _ in 0..2 {
            let envelope = rx.recv().await.unwrap();
            let EventPayload::AnswerGenerated(payload) = envelope.payload else { panic!("wrong payload") };
            assert_eq!(payload.expected_count, 2);
        }
    }

    #[tokio::test]
    async fn candidates_differ_across_sampling_profiles() {
        let (orchestrator, _bus) = harness(TemplateGenerator::new());
        let response = orchestrator.ask_multi("What is a load balancer?", 3).await.unwrap();
        let texts: std::collections::HashSet<&str> = response.candidates.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts.len(), 3, "expected three distinct candidate texts");
    }

    #[tokio::test]
    async fn out_of_range_candidate_count_is_rejected_as_config_error() {
        let (orchestrator, _bus) = harness(TemplateGenerator::new());

        let zero = orchestrator.ask_multi("What is a load balancer?", 0).await;
        assert!(matches!(zero, Err(crate::error::Error::Config(_))));

        let too_many = orchestrator
            .ask_multi("What is a load balancer?", crate::model::MAX_N + 1)
            .await;
        assert!(matches!(too_many, Err(crate::error::Error::Config(_))));
    }

    #[tokio::test]
    async fn retrieval_retries_transient_failures_before_succeeding() {
        let config = PipelineConfig::default();
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::from_config(&config));
        let (aggregator, _rx) = BatchAggregator::new(bus.clone(), config.aggregator.clone());
        // Fails twice, then succeeds; the default retry policy allows 3 attempts.
        let orchestrator = Orchestrator::new(
            InMemoryRetriever::new(corpus()).failing_first(2),
            TemplateGenerator::new(),
            bus,
            aggregator,
            config,
        );
        let response = orchestrator.ask_multi("What is a load balancer?", 2).await.unwrap();
        assert_eq!(response.candidates.len(), 2);
    }
}
