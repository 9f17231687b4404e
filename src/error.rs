use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Admission is closed; the pool is shutting down")]
    AdmissionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifies a task failure for retry decisions and for the checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Request or per-task deadline elapsed.
    Timeout,
    /// Connection could not be established or broke mid-request.
    Connection(String),
    /// 5xx or 408 from the service.
    Server { status: u16, message: String },
    /// 429 from the service, with the hinted wait.
    RateLimited { retry_after_ms: u64 },
    /// Response arrived but failed structural or range validation.
    Validation(String),
    /// 401/403.
    Auth { status: u16, message: String },
    /// Payload the service (or we) cannot process: unreadable file, unknown format, other 4xx.
    InvalidInput(String),
}

impl FailureKind {
    /// Short machine-readable code stored as `failure_kind` in checkpoint records.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection(_) => "connection",
            FailureKind::Server { .. } => "server_error",
            FailureKind::RateLimited { .. } => "rate_limited",
            FailureKind::Validation(_) => "validation",
            FailureKind::Auth { .. } => "auth",
            FailureKind::InvalidInput(_) => "invalid_input",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "request timed out"),
            FailureKind::Connection(msg) => write!(f, "connection failed: {msg}"),
            FailureKind::Server { status, message } => {
                write!(f, "server error (status {status}): {message}")
            }
            FailureKind::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {retry_after_ms}ms")
            }
            FailureKind::Validation(msg) => write!(f, "invalid response: {msg}"),
            FailureKind::Auth { status, message } => {
                write!(f, "authentication failed (status {status}): {message}")
            }
            FailureKind::InvalidInput(msg) => write!(f, "unprocessable input: {msg}"),
        }
    }
}
