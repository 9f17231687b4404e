#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vlm_batch::checkpoint::FsCheckpointStore;
use vlm_batch::executor::{TaskExecutor, ValidationPolicy};
use vlm_batch::ledger::CostLedger;
use vlm_batch::orchestrator::{PoolManager, PoolSettings};
use vlm_batch::scoring::{Completion, ImagePayload, ScoreService, ScoringError, Usage};
use vlm_batch::state_machine::RetryPolicy;

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR-fixture";
pub const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\x00\x10JFIF-fixture";

pub fn valid_result(score: f64) -> String {
    format!(
        "Looks like a photograph.\n<result>\n<is_ai_generated>false</is_ai_generated>\n\
         <watermark_present>false</watermark_present>\n\
         <watermark_location>none</watermark_location>\n\
         <score>{score}</score>\n<feedback>natural lighting</feedback>\n</result>"
    )
}

/// Write `n` PNG fixtures named `img000.png`, `img001.png`, ...
pub fn write_images(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let path = dir.join(format!("img{i:03}.png"));
            std::fs::write(&path, PNG).unwrap();
            path
        })
        .collect()
}

pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(suffix))
        .collect();
    names.sort();
    names
}

pub enum Reply {
    Ok(String),
    Err(ScoringError),
    Hang,
}

type Behavior = dyn Fn(&Path, usize) -> Reply + Send + Sync;

/// Scripted scoring service. The behavior sees the item path and the
/// 1-based call number for that item.
pub struct MockService {
    behavior: Box<Behavior>,
    delay: Duration,
    calls: AtomicUsize,
    per_item: Mutex<HashMap<PathBuf, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockService {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&Path, usize) -> Reply + Send + Sync + 'static,
    {
        Self {
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            per_item: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(|_, _| Reply::Ok(valid_result(7.0)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, item: &Path) -> usize {
        self.per_item.lock().get(item).copied().unwrap_or(0)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScoreService for MockService {
    async fn score(&self, payload: &ImagePayload) -> Result<Completion, ScoringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let nth = {
            let mut per_item = self.per_item.lock();
            let n = per_item.entry(payload.source.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (self.behavior)(&payload.source, nth) {
            Reply::Ok(content) => Ok(Completion {
                content,
                usage: Usage::new(1_000, 100),
            }),
            Reply::Err(e) => Err(e),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn settings(max_concurrency: usize) -> PoolSettings {
    PoolSettings {
        max_concurrency,
        max_attempts: 3,
        force_rerun: false,
        shutdown_grace: Duration::from_millis(200),
        retry: RetryPolicy::immediate(),
    }
}

pub fn pool(service: Arc<MockService>, settings: PoolSettings) -> PoolManager {
    let executor = TaskExecutor::new(service, Duration::from_secs(10), ValidationPolicy::Retry);
    PoolManager::new(
        executor,
        Arc::new(FsCheckpointStore::new()),
        Arc::new(CostLedger::default()),
        settings,
    )
}
