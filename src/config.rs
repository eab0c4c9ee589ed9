//! Pipeline configuration: one `Default` struct per component, each with
//! documented operational defaults and a `from_env` constructor that reads,
//! parses, and falls back to the struct default on anything missing or
//! unparsable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::SamplingParams;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|s| s != "0" && s.to_lowercase() != "false")
        .unwrap_or(default)
}

/// Number of candidates and their sampling schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// `NUM_CANDIDATES` (default 3).
    pub num_candidates: usize,
    /// `SAMPLING_PROFILES`: per-index sampling params.
    pub sampling_profiles: Vec<SamplingParams>,
    /// Per-call generation timeout.
    pub generation_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_candidates: 3,
            sampling_profiles: default_sampling_profiles(),
            generation_timeout: Duration::from_secs(60),
        }
    }
}

fn default_sampling_profiles() -> Vec<SamplingParams> {
    vec![
        SamplingParams::new(0.2),
        SamplingParams::new(0.7),
        SamplingParams::new(1.0),
    ]
}

/// Extend or truncate `profiles` to match `num_candidates`, cycling entries
/// if more candidates are requested than the schedule has entries.
fn resize_schedule(mut profiles: Vec<SamplingParams>, num_candidates: usize) -> Vec<SamplingParams> {
    if profiles.is_empty() {
        profiles = default_sampling_profiles();
    }
    if profiles.len() < num_candidates {
        let base = profiles.clone();
        while profiles.len() < num_candidates {
            let idx = profiles.len() % base.len();
            profiles.push(base[idx].clone());
        }
    }
    profiles.truncate(num_candidates.max(1));
    profiles
}

/// Parse `SAMPLING_PROFILES` as a JSON array of [`SamplingParams`], falling
/// back to [`default_sampling_profiles`] when unset or malformed, then
/// resizing the schedule to `num_candidates`.
fn parse_sampling_profiles(raw: Option<String>, num_candidates: usize) -> Vec<SamplingParams> {
    let profiles = raw
        .as_deref()
        .and_then(|s| serde_json::from_str::<Vec<SamplingParams>>(s).ok())
        .filter(|profiles: &Vec<SamplingParams>| !profiles.is_empty())
        .unwrap_or_else(default_sampling_profiles);
    resize_schedule(profiles, num_candidates)
}

impl GenerationConfig {
    pub fn from_env() -> Self {
        let num_candidates = env_parse("NUM_CANDIDATES", 3usize);
        let profiles = parse_sampling_profiles(std::env::var("SAMPLING_PROFILES").ok(), num_candidates);

        Self {
            num_candidates,
            sampling_profiles: profiles,
            generation_timeout: Duration::from_millis(env_parse(
                "GENERATION_TIMEOUT_MS",
                60_000u64,
            )),
        }
    }

    /// Sampling params for the i-th candidate slot, cycling the schedule if
    /// `index` runs past its length.
    pub fn params_for(&self, index: usize) -> SamplingParams {
        if self.sampling_profiles.is_empty() {
            return SamplingParams::new(0.7);
        }
        self.sampling_profiles[index % self.sampling_profiles.len()].clone()
    }
}

/// DPO quality gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoGateConfig {
    /// `MIN_SCORE_DIFF` (default 0.3).
    pub min_score_diff: f64,
    /// `MIN_CHOSEN_SCORE` (default 0.7).
    pub min_chosen_score: f64,
    /// `ENABLE_VERBATIM_GATE` (default true).
    pub enable_verbatim_gate: bool,
    /// Token-Jaccard threshold above which `chosen` is considered a
    /// verbatim copy of a context passage (95% by default).
    pub verbatim_threshold: f64,
}

impl Default for DpoGateConfig {
    fn default() -> Self {
        Self {
            min_score_diff: 0.3,
            min_chosen_score: 0.7,
            enable_verbatim_gate: true,
            verbatim_threshold: 0.95,
        }
    }
}

impl DpoGateConfig {
    pub fn from_env() -> Self {
        Self {
            min_score_diff: env_parse("MIN_SCORE_DIFF", 0.3),
            min_chosen_score: env_parse("MIN_CHOSEN_SCORE", 0.7),
            enable_verbatim_gate: env_bool("ENABLE_VERBATIM_GATE", true),
            verbatim_threshold: env_parse("VERBATIM_THRESHOLD", 0.95),
        }
    }
}

/// Aggregator timeouts and backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// `BATCH_TIMEOUT` (default 30 minutes).
    pub batch_timeout: Duration,
    /// `MAX_OPEN_BATCHES` (default 10 000).
    pub max_open_batches: usize,
    /// Size of the LRU of recently retired `batch_id`s used to discard late
    /// events racing a retirement.
    pub retired_lru_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(30 * 60),
            max_open_batches: 10_000,
            retired_lru_capacity: 4_096,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        Self {
            batch_timeout: Duration::from_secs(env_parse("BATCH_TIMEOUT_SECS", 1_800u64)),
            max_open_batches: env_parse("MAX_OPEN_BATCHES", 10_000usize),
            retired_lru_capacity: env_parse("RETIRED_LRU_CAPACITY", 4_096usize),
        }
    }
}

/// Judge concurrency and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// `JUDGE_CONCURRENCY` (default 4).
    pub judge_concurrency: usize,
    /// Per-call judge timeout.
    pub judge_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            judge_concurrency: 4,
            judge_timeout: Duration::from_secs(60),
        }
    }
}

impl JudgeConfig {
    pub fn from_env() -> Self {
        Self {
            judge_concurrency: env_parse("JUDGE_CONCURRENCY", 4usize),
            judge_timeout: Duration::from_millis(env_parse("JUDGE_TIMEOUT_MS", 60_000u64)),
        }
    }
}

/// Sink fsync cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    Every,
    Batch,
    Off,
}

impl std::str::FromStr for SyncPolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "every" => Ok(SyncPolicy::Every),
            "batch" => Ok(SyncPolicy::Batch),
            "off" => Ok(SyncPolicy::Off),
            _ => Err(()),
        }
    }
}

/// Sink file layout and durability policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory for `training_data_YYYYMM.jsonl`.
    pub training_dir: String,
    /// Directory for `dpo_data_YYYYMM.jsonl`.
    pub dpo_dir: String,
    /// `SINK_SYNC` (default `every`).
    pub sync_policy: SyncPolicy,
    /// Number of writes between fsyncs when `sync_policy == Batch`.
    pub batch_sync_interval: usize,
    /// Per-call timeout for the blocking fsync suspension point.
    pub fsync_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            training_dir: "./training_data".to_string(),
            dpo_dir: "./dpo_data".to_string(),
            sync_policy: SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: Duration::from_secs(1),
        }
    }
}

impl SinkConfig {
    pub fn from_env() -> Self {
        Self {
            training_dir: std::env::var("TRAINING_DIR").unwrap_or_else(|_| "./training_data".into()),
            dpo_dir: std::env::var("DPO_DIR").unwrap_or_else(|_| "./dpo_data".into()),
            sync_policy: std::env::var("SINK_SYNC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(SyncPolicy::Every),
            batch_sync_interval: env_parse("SINK_BATCH_SYNC_INTERVAL", 32usize),
            fsync_timeout: Duration::from_millis(env_parse("FSYNC_TIMEOUT_MS", 1_000u64)),
        }
    }
}

/// Aggregate configuration for the whole pipeline. The only constructor
/// parameter threaded into the orchestrator/aggregator/verifier/sinks —
/// no module-level globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub generation: GenerationConfig,
    pub dpo_gates: DpoGateConfig,
    pub aggregator: AggregatorConfig,
    pub judge: JudgeConfig,
    pub sink: SinkConfig,
    /// Default `K` passages requested from the retriever.
    pub retrieval_k: usize,
    /// Per-call retrieval timeout.
    pub retrieval_timeout: Duration,
    /// Per-call bus publish timeout.
    pub publish_timeout: Duration,
    /// Max redelivery attempts before dead-lettering.
    pub max_deliveries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            dpo_gates: DpoGateConfig::default(),
            aggregator: AggregatorConfig::default(),
            judge: JudgeConfig::default(),
            sink: SinkConfig::default(),
            retrieval_k: 5,
            retrieval_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(2),
            max_deliveries: 5,
        }
    }
}

impl PipelineConfig {
    /// Build the full configuration from environment variables, falling
    /// back to each component's documented defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            generation: GenerationConfig::from_env(),
            dpo_gates: DpoGateConfig::from_env(),
            aggregator: AggregatorConfig::from_env(),
            judge: JudgeConfig::from_env(),
            sink: SinkConfig::from_env(),
            retrieval_k: env_parse("RETRIEVAL_K", 5usize),
            retrieval_timeout: Duration::from_millis(env_parse("RETRIEVAL_TIMEOUT_MS", 5_000u64)),
            publish_timeout: Duration::from_millis(env_parse("PUBLISH_TIMEOUT_MS", 2_000u64)),
            max_deliveries: env_parse("MAX_DELIVERIES", 5u32),
        }
    }
}
