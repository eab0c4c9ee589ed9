//! Verifier worker: one event in, one `verification.completed` event out.
//! Many instances may run in parallel; each event is handled in isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::bus::{EventBus, SharedEventBus};
use crate::config::JudgeConfig;
use crate::error::Result;
use crate::judge::{HeuristicScorer, Judge, JudgeScores};
use crate::model::{AnswerGeneratedPayload, EventEnvelope, EventPayload, EventType, JudgeMode, VerificationCompletedPayload};
use crate::retry::{retry_with_backoff, RetryConfig};

/// One verifier worker. Bounds concurrent LLM judge calls with a
/// semaphore (`JUDGE_CONCURRENCY`, default 4) to protect the judge
/// backend; retries transient judge errors 3x with backoff, then degrades
/// to heuristic scoring for that event.
pub struct VerifierWorker {
    llm_judge: Option<Arc<dyn Judge>>,
    heuristic: HeuristicScorer,
    semaphore: Arc<Semaphore>,
    retry_config: RetryConfig,
    judge_timeout: Duration,
    bus: SharedEventBus,
}

impl VerifierWorker {
    /// Construct a worker with an optional LLM judge; when `llm_judge` is
    /// `None` every event is scored heuristically.
    pub fn new(bus: SharedEventBus, llm_judge: Option<Arc<dyn Judge>>, config: &JudgeConfig) -> Self {
        Self {
            llm_judge,
            heuristic: HeuristicScorer::new(),
            semaphore: Arc::new(Semaphore::new(config.judge_concurrency.max(1))),
            retry_config: RetryConfig::judge_default(),
            judge_timeout: config.judge_timeout,
            bus,
        }
    }

    /// Score one candidate, preferring the LLM judge and falling back to
    /// heuristic scoring on persistent judge failure.
    #[instrument(skip(self, contexts), fields(answer_id))]
    async fn score(
        &self,
        question: &str,
        contexts: &[crate::model::Passage],
        answer: &str,
    ) -> (JudgeScores, JudgeMode) {
        let Some(llm_judge) = self.llm_judge.clone() else {
            let scores = self.heuristic.judge(question, contexts, answer).await.expect(
                "heuristic scorer is infallible",
            );
            return (scores, JudgeMode::Heuristic);
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("verifier semaphore closed unexpectedly");

        let question = question.to_string();
        let answer = answer.to_string();
        let contexts_owned = contexts.to_vec();
        let call_timeout = self.judge_timeout;

        let result = retry_with_backoff(&self.retry_config, |e| e.is_transient(), || {
            let llm_judge = Arc::clone(&llm_judge);
            let question = question.clone();
            let answer = answer.clone();
            let contexts_owned = contexts_owned.clone();
            async move {
                match timeout(call_timeout, llm_judge.judge(&question, &contexts_owned, &answer)).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::error::Error::JudgeUnavailable("judge call timed out".into())),
                }
            }
        })
        .await;

        match result {
            Ok(scores) if scores.in_range() => (scores, JudgeMode::Llm),
            Ok(_) | Err(_) => {
                warn!("judge backend unavailable or returned out-of-range scores, falling back to heuristic");
                let scores = self
                    .heuristic
                    .judge(&question, contexts, &answer)
                    .await
                    .expect("heuristic scorer is infallible");
                (scores, JudgeMode::Heuristic)
            }
        }
    }

    /// Handle one `answer.generated` envelope, publishing exactly one
    /// `verification.completed` envelope in response.
    #[instrument(skip(self, envelope), fields(correlation_id = %envelope.correlation_id, batch_id = %envelope.batch_id))]
    pub async fn handle_event(&self, envelope: EventEnvelope) -> Result<()> {
        let EventPayload::AnswerGenerated(payload) = envelope.payload else {
            return Ok(());
        };
        self.score_and_publish(envelope.correlation_id, envelope.batch_id, payload)
            .await
    }

    async fn score_and_publish(
        &self,
        correlation_id: uuid::Uuid,
        batch_id: uuid::Uuid,
        payload: AnswerGeneratedPayload,
    ) -> Result<()> {
        let (scores, judge_mode) = self
            .score(&payload.question, &payload.contexts, &payload.answer)
            .await;

        let confidence = crate::model::Confidence::from_scores(scores.faithfulness, scores.relevancy);
        let verification = EventEnvelope::verification_completed(
            correlation_id,
            batch_id,
            VerificationCompletedPayload {
                answer_id: payload.answer_id,
                faithfulness: scores.faithfulness,
                relevancy: scores.relevancy,
                confidence,
                judge_mode,
            },
        );

        info!(judge_mode = ?judge_mode, "verification completed");
        self.bus
            .publish(EventType::VerificationCompleted.topic(), &batch_id.to_string(), verification)
            .await
    }

    /// Drive the worker loop: subscribe to `answer.generated` under
    /// `group` and process events until the channel closes. Each event is
    /// handled independently; a handler failure is logged and does not
    /// stop the loop.
    pub async fn run(self: Arc<Self>, group: &str) -> Result<()> {
        let mut rx = self.bus.subscribe(EventType::AnswerGenerated.topic(), group).await?;
        while let Some(envelope) = rx.recv().await {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = worker.handle_event(envelope).await {
                    warn!(error = %e, "verifier failed to handle event");
                }
            });
        }
        Ok(())
    }
}
