//! Job and Batch Records
//!
//! A [`Job`] is one completion request and its outcome. It moves through an
//! explicit state machine:
//!
//! ```text
//! Pending --start--> Processing --complete--> Completed
//!                        |
//!                        +--------fail------> Failed
//! ```
//!
//! A cache hit completes a pending job directly. Any other transition is
//! rejected with [`InvalidTransition`].
//!
//! A [`Batch`] groups jobs run under one parallelism limit. It is terminal
//! once every member job is terminal: `Completed` with zero failures,
//! `Partial` otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::CompletionRequest;

/// Job identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("job_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Batch identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub String);

impl BatchId {
    /// Create from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("batch_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet routed
    Pending,
    /// Being dispatched to a backend
    Processing,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// Stable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job is finished
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Rejected state transition
#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {job}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    /// Job involved
    pub job: JobId,
    /// Current status
    pub from: JobStatus,
    /// Requested status
    pub to: JobStatus,
}

/// Successful outcome attached to a completed job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Generated text
    pub text: String,
    /// Backend that served it
    pub backend: String,
    /// Model that served it
    pub model: String,
    /// Prompt tokens
    pub tokens_in: u64,
    /// Completion tokens
    pub tokens_out: u64,
    /// Cost in dollars
    pub cost: f64,
    /// Candidates tried before success
    pub attempts: u32,
    /// Whether the result came from the cache
    pub cached: bool,
}

/// One completion request and its outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,
    /// What was asked
    pub request: CompletionRequest,
    /// Current status
    pub status: JobStatus,
    /// Backend the job was served by (at most one)
    pub backend: Option<String>,
    /// Model the job was served by
    pub model_used: Option<String>,
    /// Generated text
    pub result: Option<String>,
    /// Failure message
    pub error: Option<String>,
    /// Prompt tokens
    pub tokens_in: u64,
    /// Completion tokens
    pub tokens_out: u64,
    /// Cost in dollars
    pub cost_estimate: f64,
    /// Candidates tried after the first
    pub retry_count: u32,
    /// Whether the result came from the cache
    pub cached: bool,
    /// Owning batch
    pub batch_id: Option<BatchId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When processing started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job became terminal
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job
    #[must_use]
    pub fn new(request: CompletionRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            request,
            status: JobStatus::Pending,
            backend: None,
            model_used: None,
            result: None,
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_estimate: 0.0,
            retry_count: 0,
            cached: false,
            batch_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder: attach to a batch
    #[must_use]
    pub fn in_batch(mut self, batch: BatchId) -> Self {
        self.batch_id = Some(batch);
        self
    }

    fn reject(&self, to: JobStatus) -> InvalidTransition {
        InvalidTransition {
            job: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Pending -> Processing
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Pending {
            return Err(self.reject(JobStatus::Processing));
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Pending or Processing -> Completed
    ///
    /// Only a cached outcome may complete a job that never started.
    pub fn complete(
        &mut self,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let allowed = match self.status {
            JobStatus::Processing => true,
            JobStatus::Pending => outcome.cached,
            JobStatus::Completed | JobStatus::Failed => false,
        };
        if !allowed {
            return Err(self.reject(JobStatus::Completed));
        }

        self.status = JobStatus::Completed;
        self.backend = Some(outcome.backend);
        self.model_used = Some(outcome.model);
        self.result = Some(outcome.text);
        self.tokens_in = outcome.tokens_in;
        self.tokens_out = outcome.tokens_out;
        self.cost_estimate = outcome.cost;
        self.retry_count = outcome.attempts.saturating_sub(1);
        self.cached = outcome.cached;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Processing -> Failed
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Processing {
            return Err(self.reject(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.retry_count = attempts.saturating_sub(1);
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Aggregate status of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Created, no job finished yet
    Pending,
    /// Some jobs still running
    Processing,
    /// Every job completed
    Completed,
    /// Every job finished, at least one failed
    Partial,
}

impl BatchStatus {
    /// Stable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Partial => "partial",
        }
    }

    /// Whether every member job is finished
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A group of jobs run under one parallelism limit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier
    pub id: BatchId,
    /// Member jobs in submission order
    pub job_ids: Vec<JobId>,
    /// Maximum jobs processing at once
    pub parallelism: usize,
    /// Aggregate status
    pub status: BatchStatus,
    /// Jobs completed
    pub completed: usize,
    /// Jobs failed
    pub failed: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the last job finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Create a pending batch
    #[must_use]
    pub fn new(job_ids: Vec<JobId>, parallelism: usize, now: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::generate(),
            job_ids,
            parallelism: parallelism.max(1),
            status: BatchStatus::Pending,
            completed: 0,
            failed: 0,
            created_at: now,
            completed_at: None,
        }
    }

    /// Number of member jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    /// Whether the batch has no jobs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    /// Jobs not yet finished
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len() - self.completed - self.failed
    }

    /// Record one member job reaching a terminal state
    ///
    /// Outcomes beyond the member count are ignored.
    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        if self.remaining() == 0 {
            return;
        }
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.status = BatchStatus::Processing;
        if self.remaining() == 0 {
            self.finish(now);
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.status = if self.failed == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Partial
        };
        self.completed_at = Some(now);
    }

    /// Close an empty batch
    pub fn close_if_empty(&mut self, now: DateTime<Utc>) {
        if self.is_empty() {
            self.finish(now);
        }
    }
}
