//! Task lifecycle transitions driven by attempt outcomes.

use std::fmt;
use std::time::Duration;

use crate::error::FailureKind;

use super::retry::RetryPolicy;
use super::task::{Task, TaskOutcome, TaskState};

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "PENDING"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Retrying => write!(f, "RETRYING"),
            TaskState::Succeeded => write!(f, "SUCCEEDED"),
            TaskState::Failed => write!(f, "FAILED"),
        }
    }
}

/// What the pool should do with a task after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Wait `delay`, then re-admit the task for another attempt.
    Retry { delay: Duration, reason: FailureKind },
    /// The task reached `Succeeded` or `Failed`.
    Complete(TaskState),
}

/// Drives a [`Task`] through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Begin an attempt: `Pending → Running`. Returns `false` (and changes
    /// nothing) if the task is not pending.
    pub fn start(task: &mut Task) -> bool {
        if task.state != TaskState::Pending {
            return false;
        }
        task.attempts += 1;
        task.move_to(TaskState::Running);
        true
    }

    /// Apply the outcome of the running attempt.
    ///
    /// - `Success` → `Succeeded`.
    /// - `RetryableFailure` → `Retrying` while fewer than `max_attempts`
    ///   attempts have been made, otherwise `Failed`.
    /// - `PermanentFailure` → `Failed`.
    ///
    /// Terminal tasks ignore further outcomes.
    pub fn next(task: &mut Task, outcome: TaskOutcome, policy: &RetryPolicy) -> Transition {
        if task.state.is_terminal() {
            return Transition::Complete(task.state);
        }

        match outcome {
            TaskOutcome::Success(report) => {
                task.report = Some(report);
                task.move_to(TaskState::Succeeded);
                Transition::Complete(TaskState::Succeeded)
            }
            TaskOutcome::RetryableFailure(kind) => {
                task.last_failure = Some(kind.clone());
                if task.attempts < task.max_attempts {
                    let hint = match kind {
                        FailureKind::RateLimited { retry_after_ms } => {
                            Some(Duration::from_millis(retry_after_ms))
                        }
                        _ => None,
                    };
                    task.move_to(TaskState::Retrying);
                    Transition::Retry {
                        delay: policy.delay_for_attempt(task.attempts, hint),
                        reason: kind,
                    }
                } else {
                    task.move_to(TaskState::Failed);
                    Transition::Complete(TaskState::Failed)
                }
            }
            TaskOutcome::PermanentFailure(kind) => {
                task.last_failure = Some(kind);
                task.move_to(TaskState::Failed);
                Transition::Complete(TaskState::Failed)
            }
        }
    }

    /// Backoff elapsed: `Retrying → Pending`.
    pub fn resume(task: &mut Task) -> bool {
        if task.state != TaskState::Retrying {
            return false;
        }
        task.move_to(TaskState::Pending);
        true
    }
}
