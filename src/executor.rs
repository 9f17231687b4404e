//! One request/response cycle for one item, classified for the retry policy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FailureKind;
use crate::scoring::{ImagePayload, ScoreService, ScoringError, parse_result};
use crate::state_machine::{ScoreReport, Task, TaskOutcome};

/// How to treat a response that arrived but failed validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Retry like a transient failure, up to the attempt limit.
    #[default]
    Retry,
    /// Fail the task on the first invalid response.
    Fail,
}

pub struct TaskExecutor {
    service: Arc<dyn ScoreService>,
    timeout: Duration,
    validation: ValidationPolicy,
}

impl TaskExecutor {
    pub fn new(
        service: Arc<dyn ScoreService>,
        timeout: Duration,
        validation: ValidationPolicy,
    ) -> Self {
        Self {
            service,
            timeout,
            validation,
        }
    }

    /// Read the item, call the service under the per-task timeout and classify the result.
    pub async fn execute(&self, task: &Task) -> TaskOutcome {
        let payload = match load_payload(&task.item).await {
            Ok(p) => p,
            Err(kind) => return TaskOutcome::PermanentFailure(kind),
        };

        let completion =
            match tokio::time::timeout(self.timeout, self.service.score(&payload)).await {
                Err(_) => return TaskOutcome::RetryableFailure(FailureKind::Timeout),
                Ok(Err(e)) => return self.classify(e),
                Ok(Ok(c)) => c,
            };

        match parse_result(&completion.content) {
            Ok(result) => TaskOutcome::Success(ScoreReport {
                result,
                usage: completion.usage,
            }),
            Err(e) => {
                debug!(item = %task.item.display(), error = %e, "response failed validation");
                self.invalid_response(e.to_string())
            }
        }
    }

    /// Map a client error onto the retry taxonomy.
    pub fn classify(&self, err: ScoringError) -> TaskOutcome {
        match err {
            ScoringError::RateLimited { retry_after_ms } => {
                TaskOutcome::RetryableFailure(FailureKind::RateLimited { retry_after_ms })
            }
            ScoringError::Timeout => TaskOutcome::RetryableFailure(FailureKind::Timeout),
            ScoringError::Network(e) => {
                TaskOutcome::RetryableFailure(FailureKind::Connection(e.to_string()))
            }
            ScoringError::Malformed(msg) => self.invalid_response(msg),
            ScoringError::ApiError { status, message } => match status {
                401 | 403 => TaskOutcome::PermanentFailure(FailureKind::Auth { status, message }),
                429 => TaskOutcome::RetryableFailure(FailureKind::RateLimited {
                    retry_after_ms: 1000,
                }),
                408 | 500..=599 => {
                    TaskOutcome::RetryableFailure(FailureKind::Server { status, message })
                }
                _ => TaskOutcome::PermanentFailure(FailureKind::InvalidInput(format!(
                    "status {status}: {message}"
                ))),
            },
        }
    }

    fn invalid_response(&self, msg: String) -> TaskOutcome {
        let kind = FailureKind::Validation(msg);
        match self.validation {
            ValidationPolicy::Retry => TaskOutcome::RetryableFailure(kind),
            ValidationPolicy::Fail => TaskOutcome::PermanentFailure(kind),
        }
    }
}

/// Read an item and encode it for the request. Unreadable, empty or
/// non-image files are permanent failures.
pub async fn load_payload(path: &Path) -> Result<ImagePayload, FailureKind> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FailureKind::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(FailureKind::InvalidInput("empty file".into()));
    }
    let mime = detect_mime(&bytes)
        .ok_or_else(|| FailureKind::InvalidInput("unsupported or corrupt image format".into()))?;
    Ok(ImagePayload {
        source: path.to_path_buf(),
        mime,
        base64: STANDARD.encode(&bytes),
    })
}

/// Identify an image format from its magic bytes.
pub fn detect_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        _ => None,
    }
}
