//! Retirement handling: the glue that drains the aggregator's
//! retired-batch channel, emits one SFT record per scored candidate, and
//! hands the batch to the DPO selector, logging the reason code when a
//! pair is skipped.

use tokio::sync::mpsc;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::model::{RetiredBatch, SftMetadata, SftRecord, SftVerification};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::selector::{DpoOutcome, DpoSelector};
use crate::sink::JsonlSink;

fn is_sink_retryable(error: &Error) -> bool {
    matches!(error, Error::SinkIo { .. })
}

fn sft_record_for(batch: &RetiredBatch, candidate: &crate::model::ScoredCandidateWithAnswer) -> SftRecord {
    SftRecord {
        question: batch.question.clone(),
        answer: candidate.candidate.text.clone(),
        contexts: batch.contexts.clone(),
        verification: SftVerification {
            faithfulness: candidate.scored.faithfulness,
            relevancy: candidate.scored.relevancy,
            overall: candidate.scored.overall,
            confidence: candidate.scored.confidence,
        },
        metadata: SftMetadata {
            batch_id: batch.batch_id,
            candidate_index: candidate.candidate.candidate_index,
            sampling_params: candidate.candidate.sampling_params.clone(),
            judge_mode: candidate.scored.judge_mode,
        },
        timestamp: candidate.scored.scored_at,
    }
}

/// Drains retired batches and writes SFT/DPO records to their sinks.
///
/// Two invariants are maintained here: every scored candidate in a
/// `RetiredBatch` gets exactly one SFT append (so the SFT count always
/// equals the number of candidates with both an answer and a score), and
/// the selector is invoked at most once per batch, so at most one DPO
/// record is ever emitted for it.
pub struct RetirementHandler {
    selector: DpoSelector,
    sft_sink: JsonlSink,
    dpo_sink: JsonlSink,
    sink_retry: RetryConfig,
}

impl RetirementHandler {
    pub fn new(selector: DpoSelector, sft_sink: JsonlSink, dpo_sink: JsonlSink) -> Self {
        Self {
            selector,
            sft_sink,
            dpo_sink,
            sink_retry: RetryConfig::sink_default(),
        }
    }

    pub fn with_sink_retry_config(mut self, sink_retry: RetryConfig) -> Self {
        self.sink_retry = sink_retry;
        self
    }

    /// Handle one retired batch: emit its SFT records, then attempt DPO
    /// selection. Each sink append is retried with backoff; if a write
    /// still fails once retries are exhausted, the error propagates so the
    /// caller can halt rather than silently drop the remaining records.
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id, correlation_id = %batch.correlation_id))]
    pub async fn handle(&self, batch: RetiredBatch) -> Result<()> {
        for candidate in &batch.scored_candidates {
            let record = sft_record_for(&batch, candidate);
            retry_with_backoff(&self.sink_retry, is_sink_retryable, || {
                self.sft_sink.append(&record, record.timestamp)
            })
            .await?;
        }
        info!(sft_records = batch.scored_candidates.len(), "emitted sft records");

        match self.selector.select(&batch) {
            DpoOutcome::Emitted(record) => {
                let timestamp = record.metadata.created_at;
                retry_with_backoff(&self.sink_retry, is_sink_retryable, || {
                    self.dpo_sink.append(&record, timestamp)
                })
                .await?;
                info!(score_difference = record.score_difference, "emitted dpo record");
            }
            DpoOutcome::Skipped(reason) => {
                info!(reason = %reason, "dpo pair skipped");
            }
        }
        Ok(())
    }

    /// Drain `retired_rx` until the aggregator side closes it or a sink
    /// write exhausts its retries. A sink failure that survives retry is
    /// treated as unrecoverable: the consumer stops draining rather than
    /// continue past a batch whose records may not all have landed,
    /// preferring a stalled pipeline over silent data loss.
    pub async fn run(&self, mut retired_rx: mpsc::Receiver<RetiredBatch>) {
        while let Some(batch) = retired_rx.recv().await {
            if let Err(e) = self.handle(batch).await {
                error!(error = %e, "sink write failed after exhausting retries; halting retirement consumer");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DpoGateConfig;
    use crate::config::SinkConfig;
    use crate::model::{Candidate, JudgeMode, Passage, SamplingParams, ScoredCandidate, ScoredCandidateWithAnswer};
    use uuid::Uuid;

    fn candidate(index: usize, text: &str, faithfulness: f64, relevancy: f64) -> ScoredCandidateWithAnswer {
        let candidate = Candidate::new(index, text, SamplingParams::new(0.5));
        let scored = ScoredCandidate::new(candidate.answer_id, Uuid::new_v4(), faithfulness, relevancy, JudgeMode::Heuristic);
        ScoredCandidateWithAnswer { candidate, scored }
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .map(|s| s.lines().map(String::from).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn happy_path_emits_sft_and_dpo_records() {
        let tmp = tempfile::tempdir().unwrap();
        let sink_config = SinkConfig {
            training_dir: tmp.path().join("training").to_string_lossy().to_string(),
            dpo_dir: tmp.path().join("dpo").to_string_lossy().to_string(),
            sync_policy: crate::config::SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let handler = RetirementHandler::new(
            DpoSelector::new(DpoGateConfig::default()),
            JsonlSink::for_training_data(&sink_config),
            JsonlSink::for_dpo_data(&sink_config),
        );

        let batch = RetiredBatch {
            batch_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            question: "What is a load balancer?".into(),
            contexts: vec![Passage { text: "context about load balancers".into(), source_id: "a".into(), score: 1.0 }],
            scored_candidates: vec![
                candidate(0, "A load balancer spreads traffic across many backend servers reliably", 0.95, 0.9),
                candidate(1, "Bananas are tasty", 0.2, 0.1),
            ],
            timed_out: false,
        };

        handler.handle(batch).await.unwrap();

        let now = chrono::Utc::now();
        let training_file = std::path::Path::new(&sink_config.training_dir)
            .join(format!("training_data_{:04}{:02}.jsonl", chrono::Datelike::year(&now), chrono::Datelike::month(&now)));
        let dpo_file = std::path::Path::new(&sink_config.dpo_dir)
            .join(format!("dpo_data_{:04}{:02}.jsonl", chrono::Datelike::year(&now), chrono::Datelike::month(&now)));

        assert_eq!(read_lines(&training_file).len(), 2);
        assert_eq!(read_lines(&dpo_file).len(), 1);
    }

    #[tokio::test]
    async fn gate_skip_writes_sft_but_no_dpo() {
        let tmp = tempfile::tempdir().unwrap();
        let sink_config = SinkConfig {
            training_dir: tmp.path().join("training").to_string_lossy().to_string(),
            dpo_dir: tmp.path().join("dpo").to_string_lossy().to_string(),
            sync_policy: crate::config::SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let handler = RetirementHandler::new(
            DpoSelector::new(DpoGateConfig::default()),
            JsonlSink::for_training_data(&sink_config),
            JsonlSink::for_dpo_data(&sink_config),
        );

        let batch = RetiredBatch {
            batch_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            question: "q".into(),
            contexts: vec![],
            scored_candidates: vec![
                candidate(0, "answer one", 0.82, 0.8),
                candidate(1, "answer two", 0.8, 0.78),
            ],
            timed_out: false,
        };

        handler.handle(batch).await.unwrap();

        let now = chrono::Utc::now();
        let training_file = std::path::Path::new(&sink_config.training_dir)
            .join(format!("training_data_{:04}{:02}.jsonl", chrono::Datelike::year(&now), chrono::Datelike::month(&now)));
        let dpo_dir = std::path::Path::new(&sink_config.dpo_dir);

        assert_eq!(read_lines(&training_file).len(), 2);
        assert!(!dpo_dir.exists() || std::fs::read_dir(dpo_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn run_halts_instead_of_dropping_records_after_a_batch_fails() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the dpo sink expects a directory: every dpo append's
        // `create_dir_all` fails the same way every retry, so it never
        // recovers.
        let blocked_dpo_dir = tmp.path().join("dpo_blocked");
        std::fs::write(&blocked_dpo_dir, b"not a directory").unwrap();

        let sink_config = SinkConfig {
            training_dir: tmp.path().join("training").to_string_lossy().to_string(),
            dpo_dir: blocked_dpo_dir.to_string_lossy().to_string(),
            sync_policy: crate::config::SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let handler = RetirementHandler::new(
            DpoSelector::new(DpoGateConfig::default()),
            JsonlSink::for_training_data(&sink_config),
            JsonlSink::for_dpo_data(&sink_config),
        )
        .with_sink_retry_config(RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 1,
        });

        // This batch's sft writes succeed (valid training_dir) but its dpo
        // pair emission fails against the blocked directory, so `handle`
        // returns an error after the sft loop but the batch's own sft
        // records have already landed.
        let failing_batch = RetiredBatch {
            batch_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            question: "What is a load balancer?".into(),
            contexts: vec![Passage { text: "context about load balancers".into(), source_id: "a".into(), score: 1.0 }],
            scored_candidates: vec![
                candidate(0, "A load balancer spreads traffic across many backend servers reliably", 0.95, 0.9),
                candidate(1, "Bananas are tasty", 0.2, 0.1),
            ],
            timed_out: false,
        };
        // A second batch that would add two more sft records if it were
        // ever reached.
        let unreached_batch = RetiredBatch {
            batch_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            question: "q2".into(),
            contexts: vec![],
            scored_candidates: vec![
                candidate(0, "answer one", 0.82, 0.8),
                candidate(1, "answer two", 0.8, 0.78),
            ],
            timed_out: false,
        };

        let (tx, rx) = mpsc::channel(4);
        tx.send(failing_batch).await.unwrap();
        tx.send(unreached_batch).await.unwrap();
        drop(tx);

        handler.run(rx).await;

        let now = chrono::Utc::now();
        let training_file = std::path::Path::new(&sink_config.training_dir)
            .join(format!("training_data_{:04}{:02}.jsonl", chrono::Datelike::year(&now), chrono::Datelike::month(&now)));

        // Only the failing batch's two sft records landed; the second
        // batch was never drained from the channel.
        assert_eq!(read_lines(&training_file).len(), 2);
    }
}
