//! Append-only, month-partitioned JSONL sinks: one file per calendar month
//! per record kind, single whole-line appends only, fsync cadence
//! controlled by [`crate::config::SyncPolicy`].
//!
//! Cross-writer exclusivity here is a process-local `Mutex<File>` registry
//! rather than a true OS file lock; a second process writing to the same
//! directory is not guarded against.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::config::{SinkConfig, SyncPolicy};
use crate::error::{Error, Result};

fn month_partition(timestamp: DateTime<Utc>, prefix: &str) -> String {
    format!("{prefix}_{:04}{:02}.jsonl", timestamp.year(), timestamp.month())
}

struct OpenFile {
    file: std::fs::File,
    writes_since_sync: usize,
}

/// A single append-only JSONL destination, partitioned by month.
pub struct JsonlSink {
    dir: PathBuf,
    prefix: &'static str,
    sync_policy: SyncPolicy,
    batch_sync_interval: usize,
    fsync_timeout: std::time::Duration,
    open_files: Mutex<HashMap<String, Arc<Mutex<OpenFile>>>>,
}

impl JsonlSink {
    fn new(dir: impl Into<PathBuf>, prefix: &'static str, config: &SinkConfig) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            sync_policy: config.sync_policy,
            batch_sync_interval: config.batch_sync_interval.max(1),
            fsync_timeout: config.fsync_timeout,
            open_files: Mutex::new(HashMap::new()),
        }
    }

    /// Build the sink for SFT training records, writing under
    /// `config.training_dir` as `training_data_YYYYMM.jsonl`.
    pub fn for_training_data(config: &SinkConfig) -> Self {
        Self::new(&config.training_dir, "training_data", config)
    }

    /// Build the sink for DPO preference records, writing under
    /// `config.dpo_dir` as `dpo_data_YYYYMM.jsonl`.
    pub fn for_dpo_data(config: &SinkConfig) -> Self {
        Self::new(&config.dpo_dir, "dpo_data", config)
    }

    async fn file_for(&self, timestamp: DateTime<Utc>) -> Result<Arc<Mutex<OpenFile>>> {
        let filename = month_partition(timestamp, self.prefix);
        let mut open_files = self.open_files.lock().await;
        if let Some(existing) = open_files.get(&filename) {
            return Ok(Arc::clone(existing));
        }

        let dir = self.dir.clone();
        let path = dir.join(&filename);
        let opened = task::spawn_blocking(move || open_append(&dir, &path))
            .await
            .map_err(|e| Error::Internal(format!("sink file-open task panicked: {e}")))??;

        let entry = Arc::new(Mutex::new(OpenFile { file: opened, writes_since_sync: 0 }));
        open_files.insert(filename, Arc::clone(&entry));
        Ok(entry)
    }

    /// Append one record as a single JSONL line, atomically with respect
    /// to other appenders in this process, so readers never observe a
    /// partial line. The write and any fsync run on the blocking thread
    /// pool, bounded by `fsync_timeout`.
    #[instrument(skip(self, record))]
    pub async fn append<T: Serialize + Send + 'static>(&self, record: &T, timestamp: DateTime<Utc>) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let handle = self.file_for(timestamp).await?;
        let sync_policy = self.sync_policy;
        let batch_sync_interval = self.batch_sync_interval;
        let dir_display = self.dir.display().to_string();

        let write = task::spawn_blocking(move || {
            let mut guard = handle.blocking_lock();
            let should_sync = match sync_policy {
                SyncPolicy::Every => true,
                SyncPolicy::Off => false,
                SyncPolicy::Batch => {
                    guard.writes_since_sync += 1;
                    guard.writes_since_sync >= batch_sync_interval
                }
            };

            guard
                .file
                .write_all(line.as_bytes())
                .map_err(|e| Error::sink_io(dir_display.clone(), e.to_string()))?;

            if should_sync {
                guard
                    .file
                    .sync_data()
                    .map_err(|e| Error::sink_io(dir_display.clone(), e.to_string()))?;
                guard.writes_since_sync = 0;
            }

            Ok(())
        });

        match timeout(self.fsync_timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Internal(format!("sink write task panicked: {join_error}"))),
            Err(_) => {
                warn!(dir = %self.dir.display(), "sink write/fsync exceeded its timeout");
                Err(Error::sink_io(self.dir.display().to_string(), "write/fsync timed out".to_string()))
            }
        }
    }
}

fn open_append(dir: &Path, path: &Path) -> Result<std::fs::File> {
    std::fs::create_dir_all(dir).map_err(|e| Error::sink_io(dir.display().to_string(), e.to_string()))?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::sink_io(path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, DpoCandidate, DpoMetadata, DpoRecord, JudgeMode, SftMetadata, SftRecord, SftVerification};
    use chrono::TimeZone;
    use std::io::Read;
    use uuid::Uuid;

    fn read_file(path: &Path) -> String {
        let mut contents = String::new();
        std::fs::File::open(path).unwrap().read_to_string(&mut contents).unwrap();
        contents
    }

    fn sft_record(answer: &str) -> SftRecord {
        SftRecord {
            question: "q".into(),
            answer: answer.into(),
            contexts: vec![],
            verification: SftVerification { faithfulness: 0.9, relevancy: 0.8, overall: 0.85, confidence: Confidence::High },
            metadata: SftMetadata {
                batch_id: Uuid::new_v4(),
                candidate_index: 0,
                sampling_params: crate::model::SamplingParams::new(0.5),
                judge_mode: JudgeMode::Heuristic,
            },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn appends_land_in_the_right_month_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            training_dir: tmp.path().to_string_lossy().to_string(),
            dpo_dir: tmp.path().to_string_lossy().to_string(),
            sync_policy: SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let sink = JsonlSink::for_training_data(&config);

        let timestamp = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        sink.append(&sft_record("alpha"), timestamp).await.unwrap();
        sink.append(&sft_record("beta"), timestamp).await.unwrap();

        let contents = read_file(&tmp.path().join("training_data_202603.jsonl"));
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("alpha"));
        assert!(lines[1].contains("beta"));
    }

    #[tokio::test]
    async fn appends_to_different_months_use_different_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            training_dir: tmp.path().to_string_lossy().to_string(),
            dpo_dir: tmp.path().to_string_lossy().to_string(),
            sync_policy: SyncPolicy::Off,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let sink = JsonlSink::for_training_data(&config);

        sink.append(&sft_record("jan"), Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap()).await.unwrap();
        sink.append(&sft_record("feb"), Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap()).await.unwrap();

        assert!(tmp.path().join("training_data_202601.jsonl").exists());
        assert!(tmp.path().join("training_data_202602.jsonl").exists());
    }

    #[tokio::test]
    async fn dpo_sink_writes_to_its_own_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            training_dir: tmp.path().join("training").to_string_lossy().to_string(),
            dpo_dir: tmp.path().join("dpo").to_string_lossy().to_string(),
            sync_policy: SyncPolicy::Every,
            batch_sync_interval: 32,
            fsync_timeout: std::time::Duration::from_secs(1),
        };
        let sink = JsonlSink::for_dpo_data(&config);
        let record = DpoRecord {
            prompt: "q".into(),
            chosen: DpoCandidate { text: "good".into(), score: 0.9 },
            rejected: DpoCandidate { text: "bad".into(), score: 0.2 },
            score_difference: 0.7,
            metadata: DpoMetadata {
                batch_id: Uuid::new_v4(),
                chosen_index: 0,
                rejected_index: 1,
                created_at: Utc::now(),
            },
        };
        let timestamp = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        sink.append(&record, timestamp).await.unwrap();

        let contents = read_file(&tmp.path().join("dpo").join("dpo_data_202606.jsonl"));
        assert!(contents.contains("\"chosen\""));
        assert!(contents.ends_with('\n'));
    }
}
