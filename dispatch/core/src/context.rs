//! Router Context
//!
//! [`RouterContext`] owns one dispatcher instance: catalog, circuit table,
//! cache, usage tracker, notifier, store and scheduler. Nothing is global,
//! so tests can build as many independent contexts as they like.
//!
//! # Example
//!
//! ```ignore
//! use dispatch_core::{config::load_config, context::RouterContext};
//!
//! let config = load_config()?;
//! let ctx = RouterContext::builder(config).with_ollama().build();
//! let result = ctx.complete_prompt("Explain ownership in one sentence").await?;
//! println!("{} (via {})", result.text, result.backend);
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::backend::{ModelLister, OllamaBackend, TextGenerator};
use crate::batch::{BatchReport, BatchScheduler};
use crate::cache::{CacheStats, ResultCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::DispatchConfig;
use crate::error::DispatchResult;
use crate::jobs::{Batch, BatchId, Job, JobId};
use crate::notify::{Notifier, WebhookAck, WebhookError};
use crate::routing::{
    BackendStatus, Catalog, CircuitSnapshot, CircuitTable, CompletionRequest, CompletionResult,
    ModelRegistry, RegistrySnapshot, Router, UsageExport, UsageSnapshot, UsageTracker,
};
use crate::store::{self, namespaces, JsonDirStore, KeyValueStore, MemoryStore};

/// Key the usage export is stored under
const USAGE_KEY: &str = "global";

/// Everything `status` reports
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Per-backend status in catalog order
    pub backends: Vec<BackendStatus>,
    /// Global usage, savings and recommendation
    pub usage: UsageSnapshot,
    /// Remote circuit states
    pub circuits: Vec<CircuitSnapshot>,
    /// Local model registry, when a local backend is attached
    pub local: Option<RegistrySnapshot>,
    /// Cache counters
    pub cache: CacheStats,
    /// Current preferred backend
    pub preferred_backend: Option<String>,
}

/// What `persist_state` wrote
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSummary {
    /// Circuit snapshots written or read
    pub circuits: usize,
    /// Cache entries written or read
    pub cache_entries: usize,
    /// Whether usage counters were written or read
    pub usage: bool,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`RouterContext`]
pub struct RouterContextBuilder {
    config: DispatchConfig,
    clock: SharedClock,
    catalog: Option<Catalog>,
    store: Option<Arc<dyn KeyValueStore>>,
    local: Option<(Arc<dyn TextGenerator>, Arc<dyn ModelLister>)>,
    remotes: Vec<Arc<dyn TextGenerator>>,
}

impl std::fmt::Debug for RouterContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterContextBuilder")
            .field("config", &self.config)
            .field("has_local", &self.local.is_some())
            .field("remotes", &self.remotes.len())
            .finish_non_exhaustive()
    }
}

impl RouterContextBuilder {
    /// Time source for every component
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use this catalog instead of the one derived from configuration
    #[must_use]
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use this key-value store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a local backend and the lister its registry probes
    #[must_use]
    pub fn with_local(mut self, generator: Arc<dyn TextGenerator>, lister: Arc<dyn ModelLister>) -> Self {
        self.local = Some((generator, lister));
        self
    }

    /// Attach the Ollama backend described by the configuration
    #[must_use]
    pub fn with_ollama(self) -> Self {
        let ollama = Arc::new(OllamaBackend::from_config(&self.config.local));
        self.with_local(ollama.clone(), ollama)
    }

    /// Attach a remote generator
    #[must_use]
    pub fn with_remote(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.remotes.push(generator);
        self
    }

    /// Assemble the context
    #[must_use]
    pub fn build(self) -> RouterContext {
        let clock = self.clock;
        let config = self.config;

        let store: Arc<dyn KeyValueStore> = match (self.store, &config.store_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(JsonDirStore::with_clock(dir.clone(), clock.clone())),
            (None, None) => Arc::new(MemoryStore::new(clock.clone())),
        };

        let catalog = self.catalog.unwrap_or_else(|| config.catalog());
        let circuits = Arc::new(CircuitTable::new(config.circuit.clone(), clock.clone()));
        let cache = Arc::new(ResultCache::new(config.cache.clone(), clock.clone()));
        let usage = Arc::new(UsageTracker::new(clock.clone()));

        let mut router_config = config.router.clone();
        router_config.local_timeout = config.local.timeout;

        let mut router = Router::new(catalog, router_config, circuits, cache, usage, clock.clone());
        if let Some((generator, lister)) = self.local {
            let registry = Arc::new(ModelRegistry::new(
                lister,
                config.local.refresh_interval,
                clock.clone(),
            ));
            router = router.with_local(generator, registry);
        }
        for remote in self.remotes {
            router = router.with_remote(remote);
        }
        let router = Arc::new(router);

        let notifier = Arc::new(Notifier::new(config.webhooks.clone(), clock.clone()));
        let scheduler = BatchScheduler::new(
            Arc::clone(&router),
            Arc::clone(&store),
            Arc::clone(&notifier),
            clock.clone(),
        )
        .with_default_parallelism(config.parallelism);

        tracing::debug!(
            local = router.registry().is_some(),
            parallelism = config.parallelism,
            "Router context built"
        );

        RouterContext {
            config,
            clock,
            store,
            router,
            notifier,
            scheduler,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// One independent dispatcher instance
pub struct RouterContext {
    config: DispatchConfig,
    clock: SharedClock,
    store: Arc<dyn KeyValueStore>,
    router: Arc<Router>,
    notifier: Arc<Notifier>,
    scheduler: BatchScheduler,
}

impl std::fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterContext")
            .field("router", &self.router)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl RouterContext {
    /// Start building a context from configuration
    #[must_use]
    pub fn builder(config: DispatchConfig) -> RouterContextBuilder {
        RouterContextBuilder {
            config,
            clock: system_clock(),
            catalog: None,
            store: None,
            local: None,
            remotes: Vec::new(),
        }
    }

    /// Configuration the context was built from
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The router
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The notifier
    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// The key-value store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// The time source
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ------------------------------------------------------------------------
    // Inbound contract
    // ------------------------------------------------------------------------

    /// Complete a prompt with automatic routing
    pub async fn complete_prompt(&self, prompt: &str) -> DispatchResult<CompletionResult> {
        self.complete(CompletionRequest::new(prompt)).await
    }

    /// Complete one request, recording it as a job
    pub async fn complete(&self, request: CompletionRequest) -> DispatchResult<CompletionResult> {
        let (_, result) = self.scheduler.run_one(request).await?;
        Ok(result)
    }

    /// Run a batch under the given parallelism (configured default if `None`)
    pub async fn complete_batch(
        &self,
        requests: Vec<CompletionRequest>,
        parallelism: Option<usize>,
    ) -> DispatchResult<BatchReport> {
        self.scheduler.run(requests, parallelism).await
    }

    /// Backend, usage and circuit status
    ///
    /// Re-probes the local backend first if its model list is stale.
    pub async fn status(&self) -> StatusReport {
        self.router.refresh_local().await;
        StatusReport {
            backends: self.router.backend_statuses(),
            usage: self.router.usage().snapshot(self.router.local_available()),
            circuits: self.router.circuits().snapshots(),
            local: self.router.registry().map(|r| r.snapshot()),
            cache: self.router.cache().stats(),
            preferred_backend: self.router.preferred_backend(),
        }
    }

    /// Register a completion listener
    pub fn register_webhook(
        &self,
        event: &str,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookAck, WebhookError> {
        self.notifier.register(event, url, secret)
    }

    /// Set or clear the preferred remote
    pub fn set_preferred_backend(&self, backend: Option<&str>) -> DispatchResult<()> {
        self.router.set_preferred_backend(backend)
    }

    /// Clear a backend's circuit, rate-limit mark and last error
    pub fn reset_backend(&self, backend: &str) -> DispatchResult<()> {
        self.router.reset_backend(backend)
    }

    /// Enable or disable a backend at runtime
    pub fn set_backend_enabled(&self, backend: &str, enabled: bool) -> DispatchResult<()> {
        self.router.set_backend_enabled(backend, enabled)
    }

    /// Load a persisted job
    pub async fn job(&self, id: &JobId) -> DispatchResult<Option<Job>> {
        self.scheduler.job(id).await
    }

    /// Load a persisted batch
    pub async fn batch(&self, id: &BatchId) -> DispatchResult<Option<Batch>> {
        self.scheduler.batch(id).await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Probe the local backend on the configured interval
    ///
    /// Returns `None` when no local backend is attached.
    pub fn spawn_refresher(&self) -> Option<JoinHandle<()>> {
        self.router
            .registry()
            .map(|r| r.spawn_refresher(self.config.local.refresh_interval))
    }

    /// Write circuit states, usage counters and live cache entries
    pub async fn persist_state(&self) -> DispatchResult<PersistSummary> {
        let store = self.store.as_ref();

        let snapshots = self.router.circuits().snapshots();
        for snapshot in &snapshots {
            store::save(store, namespaces::CIRCUITS, &snapshot.backend, snapshot, None).await?;
        }

        let export = self.router.usage().export(self.router.local_available());
        store::save(store, namespaces::USAGE, USAGE_KEY, &export, None).await?;

        let cache_entries = self.router.cache().save_to(store).await?;

        let summary = PersistSummary {
            circuits: snapshots.len(),
            cache_entries,
            usage: true,
        };
        tracing::info!(
            circuits = summary.circuits,
            cache_entries = summary.cache_entries,
            "Dispatcher state persisted"
        );
        Ok(summary)
    }

    /// Load circuit states, usage counters and live cache entries
    pub async fn restore_state(&self) -> DispatchResult<PersistSummary> {
        let store = self.store.as_ref();

        let mut snapshots = Vec::new();
        for key in store.keys(namespaces::CIRCUITS).await? {
            if let Some(snapshot) = store::load::<CircuitSnapshot>(store, namespaces::CIRCUITS, &key).await? {
                snapshots.push(snapshot);
            }
        }
        self.router.circuits().restore(&snapshots);

        let usage = match store::load::<UsageExport>(store, namespaces::USAGE, USAGE_KEY).await? {
            Some(export) => {
                self.router.usage().import(&export);
                true
            }
            None => false,
        };

        let cache_entries = self.router.cache().load_from(store).await?;

        let summary = PersistSummary {
            circuits: snapshots.len(),
            cache_entries,
            usage,
        };
        tracing::info!(
            circuits = summary.circuits,
            cache_entries = summary.cache_entries,
            usage = summary.usage,
            "Dispatcher state restored"
        );
        Ok(summary)
    }
}
