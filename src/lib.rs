//! # rag-dpo-pipeline
//!
//! The asynchronous fan-out/fan-in core of a retrieval-augmented preference
//! data pipeline: one question becomes a batch of independently generated
//! and independently scored candidates, joined back together by a
//! per-`batch_id` aggregator, and turned into append-only SFT and DPO
//! training records.
//!
//! ## Flow
//!
//! 1. [`orchestrator::Orchestrator::ask_multi`] retrieves context, drives
//!    the [`generator::Generator`] N times under varied sampling profiles,
//!    and publishes one `answer.generated` event per surviving candidate
//!    on the [`bus::EventBus`].
//! 2. Each event is scored independently by a [`verifier::VerifierWorker`],
//!    which publishes `verification.completed`.
//! 3. [`aggregator::BatchAggregator`] joins both event kinds by `batch_id`
//!    and retires a batch on completion or timeout.
//! 4. [`pipeline::RetirementHandler`] emits SFT records for every scored
//!    candidate and asks [`selector::DpoSelector`] to emit at most one DPO
//!    pair per batch, subject to the quality gates in [`config::DpoGateConfig`].
//! 5. [`sink::JsonlSink`] appends both streams as month-partitioned JSONL.

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod generator;
pub mod judge;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod retriever;
pub mod retry;
pub mod selector;
pub mod sink;
pub mod verifier;

pub use aggregator::BatchAggregator;
pub use bus::{EventBus, InMemoryEventBus, SharedEventBus};
pub use config::{
    AggregatorConfig, DpoGateConfig, GenerationConfig, JudgeConfig, PipelineConfig, SinkConfig,
    SyncPolicy,
};
pub use error::{Error, Result};
pub use generator::{GeneratedAnswer, Generator, TemplateGenerator};
pub use judge::{HeuristicScorer, Judge, JudgeScores, LlmJudge, RawJudgeBackend};
pub use model::{
    AnswerGeneratedPayload, Batch, Candidate, Confidence, DpoCandidate, DpoMetadata, DpoRecord,
    EventEnvelope, EventPayload, EventType, JudgeMode, Passage, RetiredBatch, SamplingParams,
    ScoredCandidate, ScoredCandidateWithAnswer, SftMetadata, SftRecord, SftVerification,
    SkipReason, MAX_N,
};
pub use orchestrator::{AskMultiResponse, CandidateSummary, Orchestrator};
pub use pipeline::RetirementHandler;
pub use retriever::{InMemoryRetriever, Retriever, RetryingRetriever};
pub use retry::{retry_with_backoff, RetryConfig};
pub use selector::{DpoOutcome, DpoSelector};
pub use sink::JsonlSink;
pub use verifier::VerifierWorker;
