//! Error types for tetora-llm

use thiserror::Error;

/// Provider error type
#[derive(Debug, Error)]
pub enum Error {
    /// Provider not configured
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// API error
    #[error("api error: {0}")]
    Api(String),

    /// Rate limit exceeded upstream
    #[error("rate limit exceeded")]
    RateLimit,

    /// Invalid response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// Timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Call cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Subprocess could not be spawned or waited on
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Subprocess exited non-zero
    #[error("process exited with code {code}: {stderr}")]
    Exit {
        /// Process exit code
        code: i32,
        /// Captured stderr (truncated)
        stderr: String,
    },
}

impl Error {
    /// Whether this error represents caller-initiated cancellation.
    ///
    /// Cancellations must not be counted against a provider's circuit.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
