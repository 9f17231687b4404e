//! Durable per-item terminal records.
//!
//! Each item `dir/photo.jpg` gets `dir/photo.json`. When that file already
//! holds the record of a sibling with the same stem (`dir/photo.png`), the
//! item falls back to `dir/photo.jpg.json`. A record only counts for the item
//! named in it.
//!
//! Records are written to a uniquely named hidden temp file in the same
//! directory, synced, then renamed over the target, so readers see either no
//! record or a complete one.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::PoolError;
use crate::ledger::Pricing;
use crate::scoring::{ScoreResult, Usage};
use crate::state_machine::{Task, TaskState};

/// The terminal result stored for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub item: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_usage: Option<Usage>,
    #[serde(default)]
    pub cost: f64,
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

/// Serialized inline as `"status": "succeeded"` plus the score fields, or
/// `"status": "failed"` plus `failure_kind` and `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Succeeded(ScoreResult),
    Failed(FailureRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_kind: String,
    pub reason: String,
}

impl CheckpointRecord {
    /// Build the record for a task in a terminal state; `None` otherwise.
    pub fn from_task(task: &Task, pricing: &Pricing, run_id: Uuid) -> Option<Self> {
        let (outcome, api_usage) = match task.state {
            TaskState::Succeeded => {
                let report = task.report.as_ref()?;
                (
                    RecordOutcome::Succeeded(report.result.clone()),
                    Some(report.usage),
                )
            }
            TaskState::Failed => {
                let failure = task.last_failure.as_ref();
                (
                    RecordOutcome::Failed(FailureRecord {
                        failure_kind: failure.map(|k| k.code()).unwrap_or("unknown").into(),
                        reason: failure.map(|k| k.to_string()).unwrap_or_default(),
                    }),
                    None,
                )
            }
            _ => return None,
        };

        Some(Self {
            item: task.item.display().to_string(),
            outcome,
            attempts: task.attempts,
            cost: api_usage.map(|u| pricing.cost_of(&u)).unwrap_or(0.0),
            api_usage,
            run_id,
            recorded_at: Utc::now(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RecordOutcome::Succeeded(_))
    }

    /// Whether this record was written for `item`. Records sit in their
    /// item's directory, so the file name identifies the item.
    pub fn belongs_to(&self, item: &Path) -> bool {
        Path::new(&self.item).file_name() == item.file_name()
    }
}

/// Where terminal records live.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether a complete record for `item` exists.
    async fn exists(&self, item: &Path) -> bool;

    /// Atomically publish `record` for `item`, replacing any previous one.
    async fn write(&self, item: &Path, record: &CheckpointRecord) -> Result<(), PoolError>;

    async fn read(&self, item: &Path) -> Result<Option<CheckpointRecord>, PoolError>;
}

const CLAIM_STRIPES: usize = 64;

/// Stores each record as JSON next to its item.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    // Serializes choosing a record path and renaming onto it, per primary path.
    claims: Arc<[Mutex<()>]>,
}

impl Default for FsCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FsCheckpointStore {
    pub fn new() -> Self {
        Self {
            claims: (0..CLAIM_STRIPES)
                .map(|_| Mutex::new(()))
                .collect::<Vec<_>>()
                .into(),
        }
    }

    /// `dir/photo.jpg` → `dir/photo.json`.
    pub fn record_path(item: &Path) -> PathBuf {
        item.with_extension("json")
    }

    /// `dir/photo.jpg` → `dir/photo.jpg.json`, used when the record path is
    /// taken by a sibling.
    pub fn fallback_path(item: &Path) -> PathBuf {
        let mut name = item
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".json");
        item.with_file_name(name)
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record.json".into());
        target.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
    }

    fn claim(&self, primary: &Path) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        primary.hash(&mut hasher);
        &self.claims[hasher.finish() as usize % self.claims.len()]
    }

    /// The record written for `item`, at either of its paths.
    async fn locate(&self, item: &Path) -> Result<Option<CheckpointRecord>, PoolError> {
        let mut unreadable = None;
        for path in [Self::record_path(item), Self::fallback_path(item)] {
            match read_record(&path).await {
                Ok(Some(record)) if record.belongs_to(item) => return Ok(Some(record)),
                Ok(_) => {}
                Err(e) => {
                    unreadable.get_or_insert(e);
                }
            }
        }
        unreadable.map_or(Ok(None), Err)
    }
}

async fn read_record(path: &Path) -> Result<Option<CheckpointRecord>, PoolError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn exists(&self, item: &Path) -> bool {
        matches!(self.locate(item).await, Ok(Some(_)))
    }

    async fn write(&self, item: &Path, record: &CheckpointRecord) -> Result<(), PoolError> {
        let primary = Self::record_path(item);
        let temp = Self::temp_path(&primary);
        let bytes = serde_json::to_vec_pretty(record)?;

        let published = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);

            let _claim = self.claim(&primary).lock().await;
            let target = match read_record(&primary).await {
                Ok(Some(existing)) if !existing.belongs_to(item) => Self::fallback_path(item),
                _ => primary.clone(),
            };
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = published {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, item: &Path) -> Result<Option<CheckpointRecord>, PoolError> {
        self.locate(item).await
    }
}

/// Recorded outcomes across a set of items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.pending
    }
}

/// Classify each item by its record. Unreadable records count as pending.
pub async fn tally<S>(store: &dyn CheckpointStore, mut items: S) -> StatusCounts
where
    S: Stream<Item = PathBuf> + Unpin,
{
    let mut counts = StatusCounts::default();
    while let Some(item) = items.next().await {
        match store.read(&item).await {
            Ok(Some(record)) if record.is_success() => counts.succeeded += 1,
            Ok(Some(_)) => counts.failed += 1,
            Ok(None) => counts.pending += 1,
            Err(e) => {
                warn!(item = %item.display(), error = %e, "unreadable record");
                counts.pending += 1;
            }
        }
    }
    counts
}
