//! Error types for tetora-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration missing or unparseable
    #[error("config error: {0}")]
    Config(String),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Provider execution failure
    #[error("provider error: {0}")]
    Provider(#[from] tetora_llm::Error),

    /// Task nesting depth over the configured limit
    #[error("max nesting depth exceeded: depth {depth} >= limit {max}")]
    DepthExceeded {
        /// Observed depth
        depth: u32,
        /// Configured maximum
        max: u32,
    },

    /// Parent already at its concurrent-children cap
    #[error("max children per task exceeded: parent {parent} already has {max} active children")]
    SpawnLimit {
        /// Parent task id
        parent: String,
        /// Configured cap
        max: usize,
    },

    /// Admission closed during shutdown
    #[error("draining: new tasks are not being accepted")]
    Draining,

    /// Session id prefix matched more than one session
    #[error("ambiguous session prefix '{prefix}': {} matches", matches.len())]
    AmbiguousSession {
        /// The prefix queried
        prefix: String,
        /// Matching session ids
        matches: Vec<String>,
    },

    /// Unknown entity (agent, session, cron job, workflow)
    #[error("not found: {0}")]
    NotFound(String),

    /// Cron expression or engine failure
    #[error("cron error: {0}")]
    Cron(String),

    /// Workflow definition or execution failure
    #[error("workflow error: {0}")]
    Workflow(String),

    /// Internal error (serialization, IO, invariant breach)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
