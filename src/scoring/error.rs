//! Error types for the scoring API client.
//!
//! [`ScoringError`] covers what can go wrong between sending a request and
//! holding a decoded completion. Classification into retryable or permanent
//! failures happens in the executor, not here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoringError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header (seconds), or 1000 when absent.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success HTTP status, with the body (or its `message` field).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    /// DNS, refused connection, reset, TLS.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// 200 OK whose body is not a usable completion (undecodable, no choices).
    #[error("malformed response: {0}")]
    Malformed(String),
}
