//! Retriever client contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::model::Passage;
use crate::retry::{retry_with_backoff, RetryConfig};

/// `retrieve(question, k) -> list<Passage>`.
///
/// Implementations should be deterministic given the store state and
/// return up to `k` passages ordered by descending score.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<Passage>>;
}

/// Wraps any [`Retriever`] with bounded exponential-backoff retry and a
/// per-call timeout: up to 3 attempts, 200ms→2s backoff, 5s per-call
/// timeout by default.
pub struct RetryingRetriever<R: Retriever> {
    inner: R,
    retry_config: RetryConfig,
    call_timeout: Duration,
}

impl<R: Retriever> RetryingRetriever<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            retry_config: RetryConfig::retriever_default(),
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

#[async_trait]
impl<R: Retriever> Retriever for RetryingRetriever<R> {
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<Passage>> {
        retry_with_backoff(
            &self.retry_config,
            Error::is_transient,
            || async {
                match timeout(self.call_timeout, self.inner.retrieve(question, k)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::retrieval_unavailable("retrieval call timed out")),
                }
            },
        )
        .await
    }
}

/// A deterministic in-memory retriever for tests and local development: a
/// fixed corpus of passages, ranked by a token-overlap score against the
/// question.
pub struct InMemoryRetriever {
    corpus: Vec<Passage>,
    /// If set, `retrieve` fails this many times before succeeding — used to
    /// exercise the retry path.
    fail_first_n: std::sync::atomic::AtomicUsize,
}

impl InMemoryRetriever {
    pub fn new(corpus: Vec<Passage>) -> Self {
        Self {
            corpus,
            fail_first_n: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first_n = std::sync::atomic::AtomicUsize::new(n);
        self
    }

    fn overlap_score(question: &str, passage: &str) -> f64 {
        let q_tokens: std::collections::HashSet<String> =
            question.to_lowercase().split_whitespace().map(String::from).collect();
        let p_tokens: HashMap<String, usize> =
            passage
                .to_lowercase()
                .split_whitespace()
                .fold(HashMap::new(), |mut acc, tok| {
                    *acc.entry(tok.to_string()).or_insert(0) += 1;
                    acc
                });
        if q_tokens.is_empty() {
            return 0.0;
        }
        let hits = q_tokens.iter().filter(|t| p_tokens.contains_key(*t)).count();
        hits as f64 / q_tokens.len() as f64
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<Passage>> {
        use std::sync::atomic::Ordering;

        let remaining = self.fail_first_n.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::retrieval_unavailable("simulated transient failure"));
        }

        let mut scored: Vec<Passage> = self
            .corpus
            .iter()
            .map(|p| Passage {
                text: p.text.clone(),
                source_id: p.source_id.clone(),
                score: Self::overlap_score(question, &p.text),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}
