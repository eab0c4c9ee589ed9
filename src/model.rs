//! Data model shared across the pipeline.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A context passage returned by the retriever. Per-request only; never
/// persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub source_id: String,
    pub score: f64,
}

/// Sampling parameters for one generator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature,
            top_p: None,
            max_tokens: None,
            seed: None,
        }
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A generated candidate answer, in-memory for the lifetime of one request.
///
/// Invariant: `candidate_index` is unique within a batch; `answer_id` is
/// globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_index: usize,
    pub text: String,
    pub sampling_params: SamplingParams,
    pub answer_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(candidate_index: usize, text: impl Into<String>, sampling_params: SamplingParams) -> Self {
        Self {
            candidate_index,
            text: text.into(),
            sampling_params,
            answer_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

/// Default cap on the number of candidates in a batch.
pub const MAX_N: usize = 8;

/// Default aggregator deadline: 30 minutes.
pub const DEFAULT_BATCH_TIMEOUT_SECS: i64 = 30 * 60;

/// A question's candidate batch, as owned synchronously by the orchestrator
/// during generation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub question: String,
    pub contexts: Vec<Passage>,
    pub expected_count: usize,
    pub candidates: Vec<Candidate>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Batch {
    /// Construct a batch, enforcing `0 < expected_count <= MAX_N` and
    /// deriving `deadline = created_at + timeout`.
    pub fn new(
        correlation_id: Uuid,
        question: impl Into<String>,
        contexts: Vec<Passage>,
        expected_count: usize,
        timeout: ChronoDuration,
    ) -> crate::error::Result<Self> {
        if expected_count == 0 || expected_count > MAX_N {
            return Err(crate::error::Error::Config(format!(
                "expected_count must be in (0, {MAX_N}], got {expected_count}"
            )));
        }
        let created_at = Utc::now();
        Ok(Self {
            batch_id: Uuid::new_v4(),
            correlation_id,
            question: question.into(),
            contexts,
            expected_count,
            candidates: Vec::new(),
            created_at,
            deadline: created_at + timeout,
        })
    }
}

/// Confidence bucket derived from `min`/`max` of faithfulness and relevancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// `high` if `min(faithfulness, relevancy) >= 0.8`; `low` if
    /// `max(faithfulness, relevancy) < 0.6`; else `medium`.
    pub fn from_scores(faithfulness: f64, relevancy: f64) -> Self {
        let min = faithfulness.min(relevancy);
        let max = faithfulness.max(relevancy);
        if min >= 0.8 {
            Confidence::High
        } else if max < 0.6 {
            Confidence::Low
        } else {
            Confidence::Medium
        }
    }
}

/// Which scoring backend produced a [`ScoredCandidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    Llm,
    Heuristic,
}

/// The output of verifying one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub answer_id: Uuid,
    pub batch_id: Uuid,
    pub faithfulness: f64,
    pub relevancy: f64,
    pub overall: f64,
    pub confidence: Confidence,
    pub judge_mode: JudgeMode,
    pub scored_at: DateTime<Utc>,
}

impl ScoredCandidate {
    pub fn new(
        answer_id: Uuid,
        batch_id: Uuid,
        faithfulness: f64,
        relevancy: f64,
        judge_mode: JudgeMode,
    ) -> Self {
        let overall = (faithfulness + relevancy) / 2.0;
        Self {
            answer_id,
            batch_id,
            faithfulness,
            relevancy,
            overall,
            confidence: Confidence::from_scores(faithfulness, relevancy),
            judge_mode,
            scored_at: Utc::now(),
        }
    }
}

/// The two event kinds carried over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AnswerGenerated,
    VerificationCompleted,
}

impl EventType {
    /// The topic name this event kind is published/subscribed under.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::AnswerGenerated => "answer.generated",
            EventType::VerificationCompleted => "verification.completed",
        }
    }
}

/// Payload of an `answer.generated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerGeneratedPayload {
    pub candidate_index: usize,
    pub answer_id: Uuid,
    pub expected_count: usize,
    pub question: String,
    pub answer: String,
    pub contexts: Vec<Passage>,
    pub sampling_params: SamplingParams,
}

/// Payload of a `verification.completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCompletedPayload {
    pub answer_id: Uuid,
    pub faithfulness: f64,
    pub relevancy: f64,
    pub confidence: Confidence,
    pub judge_mode: JudgeMode,
}

/// Tagged payload union for an [`EventEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    AnswerGenerated(AnswerGeneratedPayload),
    VerificationCompleted(VerificationCompletedPayload),
}

/// Durable, topic-routed event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub correlation_id: Uuid,
    pub batch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    /// Redelivery counter maintained by the bus, needed for
    /// `MAX_DELIVERIES` dead-lettering.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delivery_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl EventEnvelope {
    pub fn answer_generated(correlation_id: Uuid, batch_id: Uuid, payload: AnswerGeneratedPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::AnswerGenerated,
            correlation_id,
            batch_id,
            timestamp: Utc::now(),
            payload: EventPayload::AnswerGenerated(payload),
            delivery_count: 0,
        }
    }

    pub fn verification_completed(
        correlation_id: Uuid,
        batch_id: Uuid,
        payload: VerificationCompletedPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::VerificationCompleted,
            correlation_id,
            batch_id,
            timestamp: Utc::now(),
            payload: EventPayload::VerificationCompleted(payload),
            delivery_count: 0,
        }
    }
}

/// One SFT record per scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRecord {
    pub question: String,
    pub answer: String,
    pub contexts: Vec<Passage>,
    pub verification: SftVerification,
    pub metadata: SftMetadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftVerification {
    pub faithfulness: f64,
    pub relevancy: f64,
    pub overall: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftMetadata {
    pub batch_id: Uuid,
    pub candidate_index: usize,
    pub sampling_params: SamplingParams,
    pub judge_mode: JudgeMode,
}

/// At most one DPO record per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpoRecord {
    pub prompt: String,
    pub chosen: DpoCandidate,
    pub rejected: DpoCandidate,
    pub score_difference: f64,
    pub metadata: DpoMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpoCandidate {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpoMetadata {
    pub batch_id: Uuid,
    pub chosen_index: usize,
    pub rejected_index: usize,
    pub created_at: DateTime<Utc>,
}

/// Reason a batch did not produce a DPO record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ScoreDiffTooSmall,
    ChosenScoreTooLow,
    ChosenIsVerbatim,
    InsufficientCandidates,
    BatchTimedOut,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::ScoreDiffTooSmall => "score_diff_too_small",
            SkipReason::ChosenScoreTooLow => "chosen_score_too_low",
            SkipReason::ChosenIsVerbatim => "chosen_is_verbatim",
            SkipReason::InsufficientCandidates => "insufficient_candidates",
            SkipReason::BatchTimedOut => "batch_timed_out",
        };
        write!(f, "{s}")
    }
}

/// A candidate paired with its score, as handed from the aggregator to the
/// DPO selector and SFT sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidateWithAnswer {
    pub candidate: Candidate,
    pub scored: ScoredCandidate,
}

/// The aggregator's retirement payload: everything needed to emit SFT
/// records and attempt DPO selection for one batch.
#[derive(Debug, Clone)]
pub struct RetiredBatch {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub question: String,
    pub contexts: Vec<Passage>,
    pub scored_candidates: Vec<ScoredCandidateWithAnswer>,
    pub timed_out: bool,
}
