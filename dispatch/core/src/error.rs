//! Dispatch Errors
//!
//! Error taxonomy for routing a request across backends.
//!
//! Per-candidate failures ([`DispatchError::BackendUnavailable`],
//! [`DispatchError::CircuitOpen`], [`DispatchError::Timeout`]) are recovered
//! inside the router by moving to the next candidate. Only exhaustion
//! ([`DispatchError::AllBackendsFailed`]) or an empty configuration
//! ([`DispatchError::NoBackendConfigured`]) reaches the caller. A cache miss
//! is not an error; lookups return `Option`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Setup guidance shown when no backend can serve a request at all
pub const NO_BACKEND_GUIDANCE: &str = "No AI backends configured or available.\n\n\
To dispatch requests you need at least one of:\n\
1. Ollama (free, local) - install from https://ollama.ai and pull a model\n\
2. An API key in one of these environment variables:\n\
   - ANTHROPIC_API_KEY\n\
   - OPENAI_API_KEY\n\
   - GEMINI_API_KEY\n\
   - XAI_API_KEY\n\
   - PERPLEXITY_API_KEY\n\n\
Ollama is recommended for cost-free operation.";

/// One failed attempt recorded while walking the candidate list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Backend identifier (`ollama`, `openai`, ...)
    pub backend: String,
    /// Model the attempt was made with, if one was chosen
    pub model: Option<String>,
    /// Human-readable failure reason
    pub reason: String,
}

impl BackendFailure {
    /// Create a failure record
    pub fn new(backend: impl Into<String>, model: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{} ({}): {}", self.backend, model, self.reason),
            None => write!(f, "{}: {}", self.backend, self.reason),
        }
    }
}

/// Errors surfaced by the dispatch layer
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A backend was unreachable or answered with a non-success status
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        /// Backend identifier
        backend: String,
        /// Failure reason
        reason: String,
    },

    /// Every candidate was tried and failed
    #[error("all backends failed{}: {}", requested_suffix(.requested), join_failures(.failures))]
    AllBackendsFailed {
        /// Model or backend the caller asked for, if any
        requested: Option<String>,
        /// One entry per attempted (or skipped) candidate, in attempt order
        failures: Vec<BackendFailure>,
    },

    /// Nothing is usable: no local backend and no enabled remote
    #[error("{}", NO_BACKEND_GUIDANCE)]
    NoBackendConfigured,

    /// The backend's circuit breaker is open
    #[error("circuit open for backend {backend}")]
    CircuitOpen {
        /// Backend identifier
        backend: String,
    },

    /// The backend did not answer within its deadline
    #[error("backend {backend} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Backend identifier
        backend: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The caller named a backend that is not in the catalog
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Persistence collaborator failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the key-value persistence collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// Value could not be encoded or decoded
    #[error("failed to (de)serialize {namespace}/{key}: {source}")]
    Serde {
        /// Keyspace
        namespace: String,
        /// Key within the keyspace
        key: String,
        /// Underlying serde error
        source: serde_json::Error,
    },

    /// Filesystem-backed store failed
    #[error("store io error at {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },
}

/// Result alias for dispatch operations
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Heuristic used to mark remote backends as rate limited
#[must_use]
pub fn looks_rate_limited(reason: &str) -> bool {
    reason.to_lowercase().contains("rate") || reason.contains("429")
}

fn requested_suffix(requested: &Option<String>) -> String {
    requested
        .as_ref()
        .map(|r| format!(" for '{r}'"))
        .unwrap_or_default()
}

fn join_failures(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no candidates attempted".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
