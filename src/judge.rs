//! Scoring backends: an LLM-judge mode with a heuristic fallback that
//! must produce real score variance across candidates.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{Error, Result};
use crate::model::Passage;

/// The two numeric rubric scores a judge produces, both in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JudgeScores {
    pub faithfulness: f64,
    pub relevancy: f64,
}

impl JudgeScores {
    pub fn in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.faithfulness) && (0.0..=1.0).contains(&self.relevancy)
    }
}

/// `judge(question, contexts, answer) -> {faithfulness, relevancy}`.
/// Implementations may be an LLM prompt or a deterministic scorer —
/// callers do not assume which.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, question: &str, contexts: &[Passage], answer: &str) -> Result<JudgeScores>;
}

fn stopwords() -> &'static HashSet<&'static str> {
    static WORDS: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "and", "or",
            "but", "of", "to", "in", "on", "for", "with", "as", "at", "by", "this", "that",
            "it", "its", "from", "which", "what", "how", "do", "does", "did", "can", "will",
            "would", "should", "could", "has", "have", "had", "not", "no", "so", "if", "than",
        ]
        .into_iter()
        .collect()
    })
}

/// Lowercase, strip punctuation, split on whitespace, drop stopwords.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .filter(|s| !stopwords().contains(*s))
        .map(String::from)
        .collect()
}

fn bag_of_words(tokens: &[String]) -> std::collections::HashMap<String, f64> {
    let mut counts = std::collections::HashMap::new();
    for t in tokens {
        *counts.entry(t.clone()).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine_similarity(a: &[String], b: &[String]) -> f64 {
    let bag_a = bag_of_words(a);
    let bag_b = bag_of_words(b);
    if bag_a.is_empty() || bag_b.is_empty() {
        return 0.0;
    }

    let dot: f64 = bag_a
        .iter()
        .map(|(k, v)| v * bag_b.get(k).copied().unwrap_or(0.0))
        .sum();
    let norm_a = bag_a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = bag_b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Length-sanity factor penalizing answers shorter than 20 tokens or longer
/// than 800 tokens.
fn length_sanity_factor(token_count: usize) -> f64 {
    if token_count < 20 {
        0.5 + 0.5 * (token_count as f64 / 20.0)
    } else if token_count > 800 {
        (1.0 - ((token_count - 800) as f64 / 800.0)).max(0.3)
    } else {
        1.0
    }
}

/// Deterministic bag-of-words heuristic scorer: the fallback path for when
/// the LLM judge is unavailable, and a usable scorer on its own.
///
/// A flat fallback where every candidate scores identically (e.g. a
/// constant `0.675`) is useless for preference selection. This
/// implementation derives both scores directly from token overlap, which
/// varies candidate to candidate by construction.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    pub fn new() -> Self {
        Self
    }

    fn faithfulness(&self, answer: &str, contexts: &[Passage]) -> f64 {
        let answer_tokens = tokenize(answer);
        if answer_tokens.is_empty() {
            return 0.0;
        }
        let context_tokens: HashSet<String> = contexts
            .iter()
            .flat_map(|p| tokenize(&p.text))
            .collect();
        if context_tokens.is_empty() {
            return 0.0;
        }
        let covered = answer_tokens
            .iter()
            .filter(|t| context_tokens.contains(*t))
            .count();
        covered as f64 / answer_tokens.len() as f64
    }

    fn relevancy(&self, question: &str, answer: &str) -> f64 {
        let question_tokens = tokenize(question);
        let answer_tokens = tokenize(answer);
        let cosine = cosine_similarity(&question_tokens, &answer_tokens);
        let sanity = length_sanity_factor(answer_tokens.len());
        (cosine * sanity).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl Judge for HeuristicScorer {
    async fn judge(&self, question: &str, contexts: &[Passage], answer: &str) -> Result<JudgeScores> {
        Ok(JudgeScores {
            faithfulness: self.faithfulness(answer, contexts).clamp(0.0, 1.0),
            relevancy: self.relevancy(question, answer).clamp(0.0, 1.0),
        })
    }
}

/// Minimal raw-text completion interface for an LLM judge backend. The
/// actual judge model is an external collaborator; this is the seam a
/// concrete backend plugs into.
#[async_trait]
pub trait RawJudgeBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

fn judge_prompt(question: &str, contexts: &[Passage], answer: &str) -> String {
    let context_block = contexts
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n");

    format!(
        "You are grading an AI-generated answer for faithfulness to the \
         provided context and relevancy to the question.\n\n\
         QUESTION: {question}\n\nCONTEXT:\n{context_block}\n\nANSWER: {answer}\n\n\
         Respond with exactly two numbers in [0, 1], separated by a comma, in the \
         form \"faithfulness,relevancy\". Do not include any other text."
    )
}

/// Parse a judge's raw output defensively: look for two floats in `[0, 1]`.
/// Any parse failure or out-of-range value returns `None`, signalling the
/// caller to fall back to heuristic mode.
fn parse_judge_output(text: &str) -> Option<JudgeScores> {
    static NUMBER_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = NUMBER_RE.get_or_init(|| Regex::new(r"(\d*\.?\d+)").unwrap());

    let numbers: Vec<f64> = re
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();

    if numbers.len() < 2 {
        return None;
    }

    let scores = JudgeScores {
        faithfulness: numbers[0],
        relevancy: numbers[1],
    };

    if scores.in_range() {
        Some(scores)
    } else {
        None
    }
}

/// An LLM-backed judge: builds the fixed rubric prompt, calls the backend,
/// and parses the response defensively. Returns `Error::JudgeUnavailable`
/// on any backend failure or unparsable/out-of-range output, which the
/// verifier worker treats as "switch to heuristic for this event".
pub struct LlmJudge<B: RawJudgeBackend> {
    backend: B,
}

impl<B: RawJudgeBackend> LlmJudge<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: RawJudgeBackend> Judge for LlmJudge<B> {
    async fn judge(&self, question: &str, contexts: &[Passage], answer: &str) -> Result<JudgeScores> {
        let prompt = judge_prompt(question, contexts, answer);
        let raw = self.backend.complete(&prompt).await?;
        parse_judge_output(&raw)
            .ok_or_else(|| Error::JudgeUnavailable(format!("unparsable judge output: {raw:?}")))
    }
}
