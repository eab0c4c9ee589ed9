//! Batch aggregator: joins `answer.generated` and `verification.completed`
//! events per `batch_id`, retiring a batch when every expected candidate
//! has both an answer and a score, or when its deadline elapses first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::bus::{EventBus, SharedEventBus};
use crate::config::AggregatorConfig;
use crate::error::{Error, Result};
use crate::model::{
    AnswerGeneratedPayload, Candidate, EventPayload, EventType, RetiredBatch, ScoredCandidate,
    ScoredCandidateWithAnswer, VerificationCompletedPayload,
};

/// One batch's in-flight state, keyed by `answer_id` so late or duplicate
/// deliveries of the same event are idempotent.
struct OpenBatch {
    correlation_id: Uuid,
    question: String,
    contexts: Vec<crate::model::Passage>,
    expected_count: usize,
    answers: HashMap<Uuid, Candidate>,
    scores: HashMap<Uuid, ScoredCandidate>,
    deadline: Instant,
}

impl OpenBatch {
    /// A batch is complete when every expected answer has arrived and
    /// every arrived answer has a matching score.
    fn is_complete(&self) -> bool {
        self.answers.len() >= self.expected_count
            && self.scores.len() >= self.expected_count
            && self.answers.keys().all(|id| self.scores.contains_key(id))
    }

    fn into_retired(self, batch_id: Uuid, timed_out: bool) -> RetiredBatch {
        let mut scored_candidates: Vec<ScoredCandidateWithAnswer> = self
            .answers
            .into_iter()
            .filter_map(|(answer_id, candidate)| {
                self.scores
                    .get(&answer_id)
                    .cloned()
                    .map(|scored| ScoredCandidateWithAnswer { candidate, scored })
            })
            .collect();
        scored_candidates.sort_by_key(|c| c.candidate.candidate_index);

        RetiredBatch {
            batch_id,
            correlation_id: self.correlation_id,
            question: self.question,
            contexts: self.contexts,
            scored_candidates,
            timed_out,
        }
    }
}

/// Bounded FIFO of recently retired `batch_id`s: events for an
/// already-retired batch are discarded rather than reopening it.
struct RetiredSet {
    order: VecDeque<Uuid>,
    members: std::collections::HashSet<Uuid>,
    capacity: usize,
}

impl RetiredSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: std::collections::HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, batch_id: &Uuid) -> bool {
        self.members.contains(batch_id)
    }

    fn insert(&mut self, batch_id: Uuid) {
        if self.members.insert(batch_id) {
            self.order.push_back(batch_id);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.members.remove(&oldest);
                }
            }
        }
    }
}

struct AggregatorState {
    open: HashMap<Uuid, OpenBatch>,
    retired: RetiredSet,
}

/// Actor-style aggregator: a single lock around all open-batch state,
/// driven by the event bus and a deadline sweep.
pub struct BatchAggregator {
    state: Mutex<AggregatorState>,
    config: AggregatorConfig,
    bus: SharedEventBus,
    retired_tx: mpsc::Sender<RetiredBatch>,
}

impl BatchAggregator {
    /// Construct the aggregator and return it along with the channel its
    /// retired batches are pushed onto, for SFT emission and DPO selection
    /// to consume.
    pub fn new(bus: SharedEventBus, config: AggregatorConfig) -> (Arc<Self>, mpsc::Receiver<RetiredBatch>) {
        let (retired_tx, retired_rx) = mpsc::channel(1_024);
        let aggregator = Arc::new(Self {
            state: Mutex::new(AggregatorState {
                open: HashMap::new(),
                retired: RetiredSet::new(config.retired_lru_capacity),
            }),
            config,
            bus,
            retired_tx,
        });
        (aggregator, retired_rx)
    }

    /// Register a new batch the moment the orchestrator mints it, so the
    /// aggregator knows `expected_count` before any answer event arrives.
    /// `expected_count` is fixed at batch creation, never inferred from
    /// event contents.
    pub async fn open_batch(
        &self,
        batch_id: Uuid,
        correlation_id: Uuid,
        question: String,
        contexts: Vec<crate::model::Passage>,
        expected_count: usize,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.retired.contains(&batch_id) {
            return Ok(());
        }
        if state.open.len() >= self.config.max_open_batches {
            return Err(Error::AggregatorOverflow {
                open: state.open.len(),
                cap: self.config.max_open_batches,
            });
        }
        state.open.insert(
            batch_id,
            OpenBatch {
                correlation_id,
                question,
                contexts,
                expected_count,
                answers: HashMap::new(),
                scores: HashMap::new(),
                deadline: Instant::now() + self.config.batch_timeout,
            },
        );
        Ok(())
    }

    #[instrument(skip(self, payload), fields(batch_id = %batch_id))]
    async fn record_answer(&self, batch_id: Uuid, payload: AnswerGeneratedPayload) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.retired.contains(&batch_id) {
            return Ok(());
        }
        let Some(open) = state.open.get_mut(&batch_id) else {
            warn!("answer event for unknown batch; dropping");
            return Ok(());
        };
        open.answers.entry(payload.answer_id).or_insert_with(|| {
            Candidate::new(payload.candidate_index, payload.answer, payload.sampling_params)
        });
        self.maybe_retire(&mut state, batch_id).await
    }

    #[instrument(skip(self, payload), fields(batch_id = %batch_id))]
    async fn record_score(&self, batch_id: Uuid, payload: VerificationCompletedPayload) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.retired.contains(&batch_id) {
            return Ok(());
        }
        let Some(open) = state.open.get_mut(&batch_id) else {
            warn!("verification event for unknown batch; dropping");
            return Ok(());
        };
        open.scores.entry(payload.answer_id).or_insert_with(|| {
            ScoredCandidate::new(
                payload.answer_id,
                batch_id,
                payload.faithfulness,
                payload.relevancy,
                payload.judge_mode,
            )
        });
        self.maybe_retire(&mut state, batch_id).await
    }

    async fn maybe_retire(&self, state: &mut AggregatorState, batch_id: Uuid) -> Result<()> {
        let is_complete = state.open.get(&batch_id).map(|b| b.is_complete()).unwrap_or(false);
        if !is_complete {
            return Ok(());
        }
        let open = state.open.remove(&batch_id).expect("checked above");
        state.retired.insert(batch_id);
        info!("batch complete, retiring");
        let retired = open.into_retired(batch_id, false);
        let _ = self.retired_tx.send(retired).await;
        Ok(())
    }

    /// Sweep open batches for expired deadlines, retiring each with
    /// whatever candidates already have both an answer and a score. A
    /// batch never blocks past its timeout.
    pub async fn sweep_deadlines(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .open
                .iter()
                .filter(|(_, b)| b.deadline <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        for batch_id in expired {
            let mut state = self.state.lock().await;
            if let Some(open) = state.open.remove(&batch_id) {
                state.retired.insert(batch_id);
                warn!(batch_id = %batch_id, "batch timed out before completion, retiring partial");
                let retired = open.into_retired(batch_id, true);
                drop(state);
                let _ = self.retired_tx.send(retired).await;
            }
        }
        Ok(())
    }

    /// Run the deadline sweep on a fixed interval until cancelled.
    pub async fn run_deadline_sweeper(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_deadlines().await {
                warn!(error = %e, "deadline sweep failed");
            }
        }
    }

    /// Drive both bus subscriptions (`answer.generated`,
    /// `verification.completed`) under `group` until either channel
    /// closes.
    pub async fn run(self: Arc<Self>, group: &str) -> Result<()> {
        let mut answers_rx = self.bus.subscribe(EventType::AnswerGenerated.topic(), group).await?;
        let mut scores_rx = self.bus.subscribe(EventType::VerificationCompleted.topic(), group).await?;

        loop {
            tokio::select! {
                maybe_answer = answers_rx.recv() => {
                    match maybe_answer {
                        Some(envelope) => {
                            if let EventPayload::AnswerGenerated(payload) = envelope.payload {
                                if let Err(e) = self.record_answer(envelope.batch_id, payload).await {
                                    warn!(error = %e, "failed to record answer");
                                }
                            }
                        }
                        None => break,
                    }
                }
                maybe_score = scores_rx.recv() => {
                    match maybe_score {
                        Some(envelope) => {
                            if let EventPayload::VerificationCompleted(payload) = envelope.payload {
                                if let Err(e) = self.record_score(envelope.batch_id, payload).await {
                                    warn!(error = %e, "failed to record score");
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::model::{Confidence, JudgeMode, Passage, SamplingParams};
    use std::time::Duration;

    fn passage() -> Passage {
        Passage { text: "context".into(), source_id: "s".into(), score: 1.0 }
    }

    fn answer_payload(answer_id: Uuid, index: usize, expected_count: usize) -> AnswerGeneratedPayload {
        AnswerGeneratedPayload {
            candidate_index: index,
            answer_id,
            expected_count,
            question: "q".into(),
            answer: format!("answer {index}"),
            contexts: vec![passage()],
            sampling_params: SamplingParams::new(0.5),
        }
    }

    fn score_payload(answer_id: Uuid, faithfulness: f64, relevancy: f64) -> VerificationCompletedPayload {
        VerificationCompletedPayload {
            answer_id,
            faithfulness,
            relevancy,
            confidence: Confidence::from_scores(faithfulness, relevancy),
            judge_mode: JudgeMode::Heuristic,
        }
    }

    #[tokio::test]
    async fn retires_once_every_answer_has_a_score() {
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::default());
        let mut config = AggregatorConfig::default();
        config.batch_timeout = Duration::from_secs(600);
        let (aggregator, mut retired_rx) = BatchAggregator::new(bus, config);

        let batch_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        aggregator
            .open_batch(batch_id, correlation_id, "q".into(), vec![passage()], 2)
            .await
            .unwrap();

        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        aggregator.record_answer(batch_id, answer_payload(a1, 0, 2)).await.unwrap();
        aggregator.record_answer(batch_id, answer_payload(a2, 1, 2)).await.unwrap();
        aggregator.record_score(batch_id, score_payload(a1, 0.9, 0.8)).await.unwrap();

        assert!(retired_rx.try_recv().is_err());

        aggregator.record_score(batch_id, score_payload(a2, 0.4, 0.3)).await.unwrap();

        let retired = retired_rx.recv().await.unwrap();
        assert_eq!(retired.batch_id, batch_id);
        assert_eq!(retired.scored_candidates.len(), 2);
        assert!(!retired.timed_out);
    }

    #[tokio::test]
    async fn duplicate_score_delivery_on_an_open_batch_is_idempotent() {
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::default());
        let mut config = AggregatorConfig::default();
        config.batch_timeout = Duration::from_secs(600);
        let (aggregator, mut retired_rx) = BatchAggregator::new(bus, config);

        let batch_id = Uuid::new_v4();
        aggregator
            .open_batch(batch_id, Uuid::new_v4(), "q".into(), vec![passage()], 2)
            .await
            .unwrap();

        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        aggregator.record_answer(batch_id, answer_payload(a1, 0, 2)).await.unwrap();
        aggregator.record_answer(batch_id, answer_payload(a2, 1, 2)).await.unwrap();

        // Deliver the same verification.completed envelope for a1 twice
        // while the batch is still open (redelivery before retirement).
        aggregator.record_score(batch_id, score_payload(a1, 0.9, 0.8)).await.unwrap();
        aggregator.record_score(batch_id, score_payload(a1, 0.1, 0.1)).await.unwrap();
        assert!(retired_rx.try_recv().is_err());

        aggregator.record_score(batch_id, score_payload(a2, 0.4, 0.3)).await.unwrap();

        let retired = retired_rx.recv().await.unwrap();
        assert_eq!(retired.scored_candidates.len(), 2);
        let a1_score = retired
            .scored_candidates
            .iter()
            .find(|c| c.candidate.answer_id == a1)
            .expect("a1 scored exactly once");
        // The second, duplicate delivery did not overwrite the first score.
        assert!((a1_score.scored.faithfulness - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn late_event_after_retirement_is_dropped_not_reopened() {
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::default());
        let mut config = AggregatorConfig::default();
        config.batch_timeout = Duration::from_secs(600);
        let (aggregator, mut retired_rx) = BatchAggregator::new(bus, config);

        let batch_id = Uuid::new_v4();
        aggregator
            .open_batch(batch_id, Uuid::new_v4(), "q".into(), vec![passage()], 1)
            .await
            .unwrap();
        let a1 = Uuid::new_v4();
        aggregator.record_answer(batch_id, answer_payload(a1, 0, 1)).await.unwrap();
        aggregator.record_score(batch_id, score_payload(a1, 0.9, 0.8)).await.unwrap();
        retired_rx.recv().await.unwrap();

        // A duplicate/late score for the same batch must not reopen it.
        aggregator.record_score(batch_id, score_payload(a1, 0.1, 0.1)).await.unwrap();
        assert!(retired_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deadline_sweep_retires_partial_batch() {
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::default());
        let mut config = AggregatorConfig::default();
        config.batch_timeout = Duration::from_millis(10);
        let (aggregator, mut retired_rx) = BatchAggregator::new(bus, config);

        let batch_id = Uuid::new_v4();
        aggregator
            .open_batch(batch_id, Uuid::new_v4(), "q".into(), vec![passage()], 2)
            .await
            .unwrap();
        let a1 = Uuid::new_v4();
        aggregator.record_answer(batch_id, answer_payload(a1, 0, 2)).await.unwrap();
        aggregator.record_score(batch_id, score_payload(a1, 0.9, 0.8)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        aggregator.sweep_deadlines().await.unwrap();

        let retired = retired_rx.recv().await.unwrap();
        assert!(retired.timed_out);
        assert_eq!(retired.scored_candidates.len(), 1);
    }

    #[tokio::test]
    async fn overflow_rejected_when_at_capacity() {
        let bus: SharedEventBus = Arc::new(InMemoryEventBus::default());
        let mut config = AggregatorConfig::default();
        config.max_open_batches = 1;
        let (aggregator, _retired_rx) = BatchAggregator::new(bus, config);

        aggregator
            .open_batch(Uuid::new_v4(), Uuid::new_v4(), "q".into(), vec![], 1)
            .await
            .unwrap();
        let result = aggregator
            .open_batch(Uuid::new_v4(), Uuid::new_v4(), "q".into(), vec![], 1)
            .await;
        assert!(matches!(result, Err(Error::AggregatorOverflow { .. })));
    }
}
