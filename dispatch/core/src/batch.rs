//! Batch Scheduler
//!
//! Runs many independent completion requests under one parallelism limit.
//!
//! ```text
//! requests --> [Job, Job, Job, ...]        (all pending, persisted)
//!                 |
//!                 v
//!          Semaphore(P) + JoinSet          (at most P processing)
//!                 |
//!     cache hit? --yes--> completed        (no dispatch)
//!                 |no
//!                 v
//!          Router::dispatch --> completed / failed
//!                 |
//!                 v
//!          Batch counters --> completed | partial
//! ```
//!
//! Each job's outcome is recorded on its own. A failed job never cancels or
//! blocks its siblings; the batch ends `partial` instead. Job and batch
//! records are written through the key-value store, and events go to the
//! notifier after the job releases its permit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::clock::SharedClock;
use crate::error::{DispatchError, DispatchResult};
use crate::jobs::{Batch, BatchId, BatchStatus, Job, JobId, JobOutcome, JobStatus};
use crate::notify::{events, Notifier};
use crate::routing::{CompletionRequest, CompletionResult, Router};
use crate::store::{self, namespaces, KeyValueStore};

/// Parallelism used when the caller gives none
pub const DEFAULT_PARALLELISM: usize = 5;

/// Upper bound on concurrent requests in one batch
pub const MAX_PARALLELISM: usize = 1024;

/// A finished batch with its jobs in submission order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch record
    pub batch: Batch,
    /// Member jobs in submission order
    pub jobs: Vec<Job>,
}

impl BatchReport {
    /// Compact per-item view, used as the batch event payload
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch.id.clone(),
            status: self.batch.status,
            total: self.batch.len(),
            completed: self.batch.completed,
            failed: self.batch.failed,
            items: self
                .jobs
                .iter()
                .map(|job| ItemSummary {
                    job_id: job.id.clone(),
                    status: job.status,
                    backend: job.backend.clone(),
                    cached: job.cached,
                    error: job.error.clone(),
                })
                .collect(),
        }
    }
}

/// Batch event payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Aggregate status
    pub status: BatchStatus,
    /// Member count
    pub total: usize,
    /// Jobs completed
    pub completed: usize,
    /// Jobs failed
    pub failed: usize,
    /// Per-item status
    pub items: Vec<ItemSummary>,
}

/// One item of a batch summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    /// Job identifier
    pub job_id: JobId,
    /// Final status
    pub status: JobStatus,
    /// Backend that served it
    pub backend: Option<String>,
    /// Served from the cache
    pub cached: bool,
    /// Failure message
    pub error: Option<String>,
}

/// Runs batches of requests through the router
#[derive(Clone)]
pub struct BatchScheduler {
    router: Arc<Router>,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<Notifier>,
    clock: SharedClock,
    default_parallelism: usize,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("default_parallelism", &self.default_parallelism)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Create a scheduler
    pub fn new(
        router: Arc<Router>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<Notifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            router,
            store,
            notifier,
            clock,
            default_parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Builder: parallelism used when a batch names none
    #[must_use]
    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.default_parallelism = parallelism.clamp(1, MAX_PARALLELISM);
        self
    }

    /// Parallelism used when a batch names none
    #[must_use]
    pub fn default_parallelism(&self) -> usize {
        self.default_parallelism
    }

    /// Run every request and wait for all of them
    ///
    /// Fails only when the initial job and batch records cannot be
    /// persisted. Per-job failures are reported in the returned jobs.
    pub async fn run(
        &self,
        requests: Vec<CompletionRequest>,
        parallelism: Option<usize>,
    ) -> DispatchResult<BatchReport> {
        let now = self.clock.now();
        let parallelism = parallelism
            .unwrap_or(self.default_parallelism)
            .clamp(1, requests.len().clamp(1, MAX_PARALLELISM));

        let jobs: Vec<Job> = requests.into_iter().map(|r| Job::new(r, now)).collect();
        let mut batch = Batch::new(jobs.iter().map(|j| j.id.clone()).collect(), parallelism, now);
        let mut slots: Vec<Job> = jobs
            .into_iter()
            .map(|j| j.in_batch(batch.id.clone()))
            .collect();

        for job in &slots {
            store::save(self.store.as_ref(), namespaces::JOBS, job.id.as_str(), job, None).await?;
        }
        store::save(self.store.as_ref(), namespaces::BATCHES, batch.id.as_str(), &batch, None).await?;

        tracing::info!(
            batch_id = %batch.id,
            jobs = batch.len(),
            parallelism,
            "Batch started"
        );

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut join_set = JoinSet::new();
        for (index, job) in slots.iter().cloned().enumerate() {
            let scheduler = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let job = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let job = scheduler.run_job(job).await;
                        drop(permit);
                        job
                    }
                    Err(_) => scheduler.fail_unstarted(job, "scheduler shut down"),
                };
                scheduler.persist_job(&job).await;
                scheduler.notify_job(&job).await;
                (index, job)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, job)) => {
                    batch.record(job.status == JobStatus::Completed, self.clock.now());
                    slots[index] = job;
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch.id, error = %e, "Batch job task panicked");
                }
            }
        }

        // Jobs whose task panicked never reported back
        for job in &mut slots {
            if !job.status.is_terminal() {
                let failed = self.fail_unstarted(job.clone(), "job task aborted");
                batch.record(false, self.clock.now());
                self.persist_job(&failed).await;
                *job = failed;
            }
        }

        batch.close_if_empty(self.clock.now());
        if let Err(e) =
            store::save(self.store.as_ref(), namespaces::BATCHES, batch.id.as_str(), &batch, None).await
        {
            tracing::warn!(batch_id = %batch.id, error = %e, "Failed to persist batch");
        }

        tracing::info!(
            batch_id = %batch.id,
            status = %batch.status,
            completed = batch.completed,
            failed = batch.failed,
            "Batch finished"
        );

        let report = BatchReport { batch, jobs: slots };
        let event = if report.batch.status == BatchStatus::Completed {
            events::BATCH_COMPLETED
        } else {
            events::BATCH_PARTIAL
        };
        match serde_json::to_value(report.summary()) {
            Ok(data) => {
                self.notifier.trigger(event, data).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode batch summary"),
        }

        Ok(report)
    }

    /// Load a persisted job
    pub async fn job(&self, id: &JobId) -> DispatchResult<Option<Job>> {
        Ok(store::load(self.store.as_ref(), namespaces::JOBS, id.as_str()).await?)
    }

    /// Load a persisted batch
    pub async fn batch(&self, id: &BatchId) -> DispatchResult<Option<Batch>> {
        Ok(store::load(self.store.as_ref(), namespaces::BATCHES, id.as_str()).await?)
    }

    /// Run one request outside any batch
    ///
    /// The job is persisted and announced like a batch member. When every
    /// backend fails the router's error is returned and the job is left
    /// `failed` in the store.
    pub async fn run_one(&self, request: CompletionRequest) -> DispatchResult<(Job, CompletionResult)> {
        let mut job = Job::new(request, self.clock.now());
        store::save(self.store.as_ref(), namespaces::JOBS, job.id.as_str(), &job, None).await?;

        let result = match self.router.cached(&job.request) {
            Some(hit) => Ok(hit),
            None => {
                if let Err(e) = job.start(self.clock.now()) {
                    tracing::error!(error = %e, "Invalid job transition");
                }
                self.persist_job(&job).await;
                self.router.dispatch(&job.request).await
            }
        };

        let now = self.clock.now();
        let transition = match &result {
            Ok(done) => job.complete(outcome(done.clone()), now),
            Err(e) => job.fail(e.to_string(), attempts_for(e), now),
        };
        if let Err(e) = transition {
            tracing::error!(error = %e, "Invalid job transition");
        }
        self.persist_job(&job).await;
        self.notify_job(&job).await;

        result.map(|done| (job, done))
    }

    async fn run_job(&self, mut job: Job) -> Job {
        if let Some(hit) = self.router.cached(&job.request) {
            tracing::debug!(job_id = %job.id, "Job served from cache");
            if let Err(e) = job.complete(outcome(hit), self.clock.now()) {
                tracing::error!(error = %e, "Invalid job transition");
            }
            return job;
        }

        if let Err(e) = job.start(self.clock.now()) {
            tracing::error!(error = %e, "Invalid job transition");
            return job;
        }
        self.persist_job(&job).await;

        let transition = match self.router.dispatch(&job.request).await {
            Ok(result) => job.complete(outcome(result), self.clock.now()),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job failed");
                job.fail(e.to_string(), attempts_for(&e), self.clock.now())
            }
        };
        if let Err(e) = transition {
            tracing::error!(error = %e, "Invalid job transition");
        }
        job
    }

    fn fail_unstarted(&self, mut job: Job, reason: &str) -> Job {
        let now = self.clock.now();
        if job.status == JobStatus::Pending {
            let _ = job.start(now);
        }
        if let Err(e) = job.fail(reason, 0, now) {
            tracing::error!(error = %e, "Invalid job transition");
        }
        job
    }

    async fn persist_job(&self, job: &Job) {
        if let Err(e) = store::save(self.store.as_ref(), namespaces::JOBS, job.id.as_str(), job, None).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist job");
        }
    }

    async fn notify_job(&self, job: &Job) {
        let event = match job.status {
            JobStatus::Completed => events::JOB_COMPLETED,
            JobStatus::Failed => events::JOB_FAILED,
            JobStatus::Pending | JobStatus::Processing => return,
        };
        let data = serde_json::json!({
            "job_id": job.id,
            "batch_id": job.batch_id,
            "status": job.status,
            "backend": job.backend,
            "model": job.model_used,
            "cached": job.cached,
            "tokens": job.tokens_in + job.tokens_out,
            "cost": job.cost_estimate,
            "error": job.error,
        });
        self.notifier.trigger(event, data).await;
    }
}

fn attempts_for(error: &DispatchError) -> u32 {
    match error {
        DispatchError::AllBackendsFailed { failures, .. } => {
            u32::try_from(failures.len()).unwrap_or(u32::MAX)
        }
        _ => 1,
    }
}

fn outcome(result: CompletionResult) -> JobOutcome {
    // Unreported token counts are attributed to the completion side
    let (tokens_in, tokens_out) = if result.tokens_in + result.tokens_out > 0 {
        (result.tokens_in, result.tokens_out)
    } else {
        (0, result.tokens)
    };
    JobOutcome {
        text: result.text,
        backend: result.backend,
        model: result.model,
        tokens_in,
        tokens_out,
        cost: result.cost,
        attempts: result.attempts,
        cached: result.cached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelInfo;
    use crate::cache::{CacheConfig, ResultCache};
    use crate::clock::ManualClock;
    use crate::notify::WebhookConfig;
    use crate::routing::test_utils::{ScriptedBackend, ScriptedLister};
    use crate::routing::{
        Catalog, CircuitConfig, CircuitState, CircuitTable, ModelRegistry, RouterConfig,
        UsageTracker, LOCAL_BACKEND,
    };
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        scheduler: BatchScheduler,
        router: Arc<Router>,
        local: Arc<ScriptedBackend>,
        store: Arc<MemoryStore>,
    }

    fn fixture(local: ScriptedBackend, lister: ScriptedLister, catalog: Catalog, remotes: Vec<Arc<ScriptedBackend>>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let local = Arc::new(local);
        let registry = Arc::new(ModelRegistry::new(
            Arc::new(lister),
            Duration::from_secs(300),
            clock.clone(),
        ));
        let mut router = Router::new(
            catalog,
            RouterConfig::default(),
            Arc::new(CircuitTable::new(CircuitConfig::default(), clock.clone())),
            Arc::new(ResultCache::new(CacheConfig::default(), clock.clone())),
            Arc::new(UsageTracker::new(clock.clone())),
            clock.clone(),
        )
        .with_local(local.clone(), registry);
        for remote in remotes {
            router = router.with_remote(remote);
        }
        let router = Arc::new(router);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let notifier = Arc::new(Notifier::new(WebhookConfig::default(), clock.clone()));
        let scheduler = BatchScheduler::new(router.clone(), store.clone(), notifier, clock);
        Fixture {
            scheduler,
            router,
            local,
            store,
        }
    }

    fn installed() -> ScriptedLister {
        ScriptedLister::new(vec![ModelInfo::new("llama3.2:3b", 1)])
    }

    fn prompts(n: usize) -> Vec<CompletionRequest> {
        (0..n).map(|i| CompletionRequest::new(format!("prompt {i}"))).collect()
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let f = fixture(
            ScriptedBackend::new(LOCAL_BACKEND).with_delay(Duration::from_millis(20)),
            installed(),
            Catalog::builtin(),
            Vec::new(),
        );

        let report = f.scheduler.run(prompts(12), Some(3)).await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Completed);
        assert_eq!(report.batch.completed, 12);
        assert_eq!(f.local.calls(), 12);
        assert!(f.local.max_in_flight() <= 3, "saw {}", f.local.max_in_flight());
    }

    #[tokio::test]
    async fn test_jobs_keep_submission_order_and_are_persisted() {
        let f = fixture(ScriptedBackend::new(LOCAL_BACKEND), installed(), Catalog::builtin(), Vec::new());

        let report = f.scheduler.run(prompts(4), None).await.unwrap();
        for (i, job) in report.jobs.iter().enumerate() {
            assert_eq!(job.request.prompt, format!("prompt {i}"));
            assert_eq!(job.batch_id.as_ref(), Some(&report.batch.id));
            let stored = f.scheduler.job(&job.id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Completed);
        }
        let stored = f.scheduler.batch(&report.batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(f.store.len(), 5);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_dispatch() {
        let f = fixture(ScriptedBackend::new(LOCAL_BACKEND), installed(), Catalog::builtin(), Vec::new());
        f.router.complete(&CompletionRequest::new("prompt 0")).await.unwrap();
        assert_eq!(f.local.calls(), 1);

        let report = f.scheduler.run(prompts(2), None).await.unwrap();
        assert_eq!(f.local.calls(), 2);
        assert!(report.jobs[0].cached);
        assert!(report.jobs[0].started_at.is_none());
        assert!(!report.jobs[1].cached);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let mut catalog = Catalog::builtin();
        catalog.set_enabled("openai", true);
        let openai = Arc::new(ScriptedBackend::new("openai"));
        let f = fixture(
            ScriptedBackend::new(LOCAL_BACKEND),
            installed(),
            catalog,
            vec![openai.clone()],
        );
        f.router.circuits().breaker("openai").force_state(CircuitState::Open);

        let mut requests = prompts(7);
        requests.extend((0..3).map(|i| CompletionRequest::new(format!("paid {i}")).with_backend("openai")));

        let report = f.scheduler.run(requests, Some(4)).await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Partial);
        assert_eq!((report.batch.completed, report.batch.failed), (7, 3));
        assert_eq!(openai.calls(), 0);
        assert!(report.jobs[7..].iter().all(|j| j.status == JobStatus::Failed
            && j.error.as_deref().is_some_and(|e| e.contains("circuit open"))));
    }

    #[tokio::test]
    async fn test_oversized_parallelism_is_clamped() {
        let f = fixture(ScriptedBackend::new(LOCAL_BACKEND), installed(), Catalog::builtin(), Vec::new());

        let report = f.scheduler.run(prompts(3), Some(usize::MAX)).await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Completed);
        assert_eq!(report.batch.parallelism, 3);
        assert_eq!(f.local.calls(), 3);

        let report = f.scheduler.run(prompts(1), Some(0)).await.unwrap();
        assert_eq!(report.batch.parallelism, 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let f = fixture(ScriptedBackend::new(LOCAL_BACKEND), installed(), Catalog::builtin(), Vec::new());
        let report = f.scheduler.run(Vec::new(), None).await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Completed);
        assert!(report.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_all_failed_batch_is_partial() {
        let f = fixture(
            ScriptedBackend::failing(LOCAL_BACKEND, "boom"),
            installed(),
            Catalog::builtin(),
            Vec::new(),
        );
        let report = f.scheduler.run(prompts(3), Some(2)).await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Partial);
        assert_eq!(report.batch.failed, 3);
        let summary = report.summary();
        assert_eq!(summary.total, 3);
        assert!(summary.items.iter().all(|i| i.error.is_some()));
    }

    #[tokio::test]
    async fn test_run_one_records_job() {
        let f = fixture(ScriptedBackend::new(LOCAL_BACKEND), installed(), Catalog::builtin(), Vec::new());

        let (job, result) = f.scheduler.run_one(CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, LOCAL_BACKEND);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.batch_id.is_none());
        let stored = f.scheduler.job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some(result.text.as_str()));

        let (again, _) = f.scheduler.run_one(CompletionRequest::new("hello")).await.unwrap();
        assert!(again.cached);
        assert_eq!(f.local.calls(), 1);
    }

    #[tokio::test]
    async fn test_run_one_failure_is_returned_and_stored() {
        let f = fixture(
            ScriptedBackend::failing(LOCAL_BACKEND, "model crashed"),
            installed(),
            Catalog::builtin(),
            Vec::new(),
        );

        let err = f.scheduler.run_one(CompletionRequest::new("hello")).await.unwrap_err();
        assert!(err.to_string().contains("model crashed"));
        assert_eq!(f.store.len(), 1);
    }
}
