//! The pool: pulls items lazily, admits them through the
//! [`AdmissionController`], drives each through the state machine and
//! commits its terminal record.
//!
//! Every admitted item runs as its own tokio task inside a `JoinSet`. An
//! item holds an admission slot only while an attempt is in flight; during
//! backoff the slot is released and re-acquired at the back of the queue.
//!
//! Shutdown has two stages. [`ShutdownHandle::request_shutdown`] stops
//! pulling new items, closes admission and cancels pending retries, while
//! attempts already in flight may finish and commit. If they have not
//! finished within the grace period (or [`ShutdownHandle::abort`] is
//! called) they are abandoned at their next suspension point. A checkpoint
//! write that has started is never interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::error::FailureKind;
use crate::executor::TaskExecutor;
use crate::ledger::CostLedger;
use crate::state_machine::{RetryPolicy, StateMachine, Task, TaskState, Transition};
use crate::ui::RunProgress;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    /// Re-process items that already have a record.
    pub force_rerun: bool,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 50_000,
            max_attempts: 3,
            force_rerun: false,
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Clonable handle for stopping a running pool from elsewhere
/// (signal handlers, tests).
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl ShutdownHandle {
    /// Graceful stop: no new items, no new retries, in-flight attempts may finish.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Abandon in-flight attempts now. Implies shutdown.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Counts for one call to [`PoolManager::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Items admitted and handed to a task.
    pub submitted: u64,
    /// Items skipped because a record already existed.
    pub skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Stopped by shutdown before reaching a terminal state; no record written.
    pub abandoned: u64,
    /// Reached a terminal state but the record could not be written.
    pub unrecorded: u64,
    pub panicked: u64,
    pub peak_in_flight: usize,
    pub interrupted: bool,
}

impl RunSummary {
    /// Items that reached a terminal state and have a record.
    pub fn committed(&self) -> u64 {
        self.succeeded + self.failed
    }

    fn absorb(&mut self, joined: Result<TaskReport, JoinError>) {
        match joined {
            Ok(report) => match report.disposition {
                Disposition::Succeeded => self.succeeded += 1,
                Disposition::Failed => self.failed += 1,
                Disposition::Abandoned => self.abandoned += 1,
                Disposition::Unrecorded => self.unrecorded += 1,
            },
            Err(e) => {
                error!(error = %e, "task crashed");
                self.panicked += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Succeeded,
    Failed,
    Abandoned,
    Unrecorded,
}

#[derive(Debug)]
struct TaskReport {
    disposition: Disposition,
}

/// State shared by the pull loop and every task.
struct Shared {
    executor: Arc<TaskExecutor>,
    store: Arc<dyn CheckpointStore>,
    ledger: Arc<CostLedger>,
    admission: AdmissionController,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    abort: CancellationToken,
    progress: Arc<RunProgress>,
    run_id: Uuid,
}

pub struct PoolManager {
    shared: Arc<Shared>,
    settings: PoolSettings,
}

impl PoolManager {
    pub fn new(
        executor: TaskExecutor,
        store: Arc<dyn CheckpointStore>,
        ledger: Arc<CostLedger>,
        settings: PoolSettings,
    ) -> Self {
        Self::with_progress(
            executor,
            store,
            ledger,
            settings,
            Arc::new(RunProgress::hidden()),
        )
    }

    pub fn with_progress(
        executor: TaskExecutor,
        store: Arc<dyn CheckpointStore>,
        ledger: Arc<CostLedger>,
        settings: PoolSettings,
        progress: Arc<RunProgress>,
    ) -> Self {
        let abort = CancellationToken::new();
        let shared = Shared {
            executor: Arc::new(executor),
            store,
            ledger,
            admission: AdmissionController::new(settings.max_concurrency),
            retry: settings.retry.clone(),
            shutdown: abort.child_token(),
            abort,
            progress,
            run_id: Uuid::new_v4(),
        };
        Self {
            shared: Arc::new(shared),
            settings,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shared.shutdown.clone(),
            abort: self.shared.abort.clone(),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.shared.ledger
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    /// Process every item from `items` until the stream ends or shutdown is
    /// requested, then wait for admitted tasks to settle.
    ///
    /// Items are pulled only while fewer than twice `max_concurrency` tasks
    /// are alive, so a huge input never materializes in memory.
    pub async fn run<S>(&self, mut items: S) -> RunSummary
    where
        S: Stream<Item = PathBuf> + Unpin,
    {
        let shared = &self.shared;
        let max_live = self.settings.max_concurrency.max(1).saturating_mul(2);
        let mut tasks: JoinSet<TaskReport> = JoinSet::new();
        let mut summary = RunSummary::default();

        info!(
            run_id = %shared.run_id,
            max_concurrency = shared.admission.capacity(),
            max_attempts = self.settings.max_attempts,
            force_rerun = self.settings.force_rerun,
            "pool started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                summary.absorb(joined);
            }

            if tasks.len() >= max_live {
                tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    Some(joined) = tasks.join_next() => summary.absorb(joined),
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                item = items.next() => Some(item),
            };
            let item = match next {
                Some(Some(item)) => item,
                Some(None) => {
                    debug!("input exhausted");
                    break;
                }
                None => break,
            };

            if !self.settings.force_rerun && shared.store.exists(&item).await {
                debug!(item = %item.display(), "record exists, skipping");
                summary.skipped += 1;
                shared.progress.skipped();
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                acquired = shared.admission.acquire() => acquired.ok(),
            };
            let Some(permit) = permit else {
                break;
            };

            summary.submitted += 1;
            let task = Task::new(item, self.settings.max_attempts);
            tasks.spawn(drive(Arc::clone(shared), task, permit));
        }

        self.drain(&mut tasks, &mut summary).await;

        summary.peak_in_flight = shared.admission.peak_in_flight();
        summary.interrupted = shared.shutdown.is_cancelled();
        shared.progress.finish();

        info!(
            run_id = %shared.run_id,
            submitted = summary.submitted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            abandoned = summary.abandoned,
            unrecorded = summary.unrecorded,
            interrupted = summary.interrupted,
            "pool finished"
        );
        summary
    }

    /// Wait for every live task. Once shutdown is requested, admission is
    /// closed and the remaining tasks get `shutdown_grace` before abort.
    async fn drain(&self, tasks: &mut JoinSet<TaskReport>, summary: &mut RunSummary) {
        let shared = &self.shared;
        let mut deadline: Option<Instant> = None;

        loop {
            if deadline.is_none() && shared.shutdown.is_cancelled() {
                shared.admission.close();
                deadline = Some(Instant::now() + self.settings.shutdown_grace);
                info!(
                    in_flight = tasks.len(),
                    grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                    "shutdown requested, draining"
                );
            }

            let remaining = tasks.len();
            let joined = match deadline {
                None => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = shared.shutdown.cancelled() => continue,
                },
                Some(deadline) => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = tokio::time::sleep_until(deadline), if !shared.abort.is_cancelled() => {
                        warn!(remaining, "grace period elapsed, abandoning in-flight work");
                        shared.abort.cancel();
                        continue;
                    }
                },
            };

            match joined {
                Some(joined) => summary.absorb(joined),
                None => break,
            }
        }
    }
}

/// Run one item to a terminal state (or until shutdown) and commit it.
async fn drive(shared: Arc<Shared>, mut task: Task, mut permit: AdmissionPermit) -> TaskReport {
    loop {
        StateMachine::start(&mut task);
        debug!(
            item = %task.item.display(),
            attempt = task.attempts,
            in_flight = shared.admission.in_flight(),
            "attempt started"
        );

        let outcome = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => None,
            outcome = shared.executor.execute(&task) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            return abandon(&task);
        };

        match StateMachine::next(&mut task, outcome, &shared.retry) {
            Transition::Complete(state) => {
                let disposition = commit(&shared, &task, state).await;
                permit.release();
                return TaskReport { disposition };
            }
            Transition::Retry { delay, reason } => {
                permit.release();
                warn!(
                    item = %task.item.display(),
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "attempt failed, retrying"
                );
                shared
                    .progress
                    .retry(&task.item, task.attempts, task.max_attempts, &reason);

                let slept = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                };
                if !slept {
                    return abandon(&task);
                }
                StateMachine::resume(&mut task);

                let acquired = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => None,
                    acquired = shared.admission.acquire() => acquired.ok(),
                };
                match acquired {
                    Some(p) => permit = p,
                    None => return abandon(&task),
                }
            }
        }
    }
}

/// Write the terminal record and account for it. Runs to completion
/// regardless of shutdown.
async fn commit(shared: &Shared, task: &Task, state: TaskState) -> Disposition {
    let Some(record) = CheckpointRecord::from_task(task, &shared.ledger.pricing(), shared.run_id)
    else {
        error!(item = %task.item.display(), state = %state, "terminal task without a report");
        return Disposition::Unrecorded;
    };

    if let Err(e) = shared.store.write(&task.item, &record).await {
        error!(item = %task.item.display(), error = %e, "failed to write record");
        return Disposition::Unrecorded;
    }

    // Ledger totals cover recorded items only.
    match (&task.report, state) {
        (Some(report), TaskState::Succeeded) => {
            shared.ledger.add(&report.usage);
            debug!(
                item = %task.item.display(),
                score = report.result.score,
                attempts = task.attempts,
                "item succeeded"
            );
            shared.progress.succeeded(&task.item, report.result.score);
            Disposition::Succeeded
        }
        _ => {
            let reason = task
                .last_failure
                .clone()
                .unwrap_or_else(|| FailureKind::InvalidInput("unknown failure".into()));
            warn!(
                item = %task.item.display(),
                attempts = task.attempts,
                reason = %reason,
                "item failed"
            );
            shared.ledger.note_failure();
            shared.progress.failed(&task.item, &reason);
            Disposition::Failed
        }
    }
}

fn abandon(task: &Task) -> TaskReport {
    info!(
        item = %task.item.display(),
        state = %task.state,
        attempts = task.attempts,
        "abandoned by shutdown"
    );
    TaskReport {
        disposition: Disposition::Abandoned,
    }
}
