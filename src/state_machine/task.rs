//! Per-item task state: attempts, last failure and the final report.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::scoring::{ScoreResult, Usage};

/// Validated verdict plus the usage that paid for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub result: ScoreResult,
    pub usage: Usage,
}

/// Classified result of one attempt, as produced by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(ScoreReport),
    RetryableFailure(FailureKind),
    PermanentFailure(FailureKind),
}

/// Lifecycle state of a task.
///
/// `Pending → Running → {Succeeded, Retrying, Failed}`, and `Retrying → Pending`
/// once the backoff delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// One input item and its full attempt history.
#[derive(Debug, Clone)]
pub struct Task {
    pub item: PathBuf,
    pub state: TaskState,
    pub state_history: Vec<TaskState>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_failure: Option<FailureKind>,
    pub report: Option<ScoreReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(item: PathBuf, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            item,
            state: TaskState::Pending,
            state_history: Vec::new(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_failure: None,
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn move_to(&mut self, next: TaskState) {
        self.state_history.push(self.state);
        self.state = next;
        self.updated_at = Utc::now();
    }
}
