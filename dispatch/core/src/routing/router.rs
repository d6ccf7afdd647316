//! Request Router
//!
//! Builds an ordered candidate list for each completion request and walks
//! it until one backend answers.
//!
//! # Candidate Order
//!
//! ```text
//! requested backend / model owner (if any, and usable)
//!         |
//!         v
//! local backend (free, if probed available and a model fits)
//!         |
//!         v
//! preferred remote (runtime or config preference)
//!         |
//!         v
//! remaining enabled remotes, cheapest first
//! ```
//!
//! Remotes with an open circuit or an active rate-limit mark are recorded
//! as failures and skipped without a network call. A request that names a
//! backend whose circuit is open fails at once, with no fallback. The local backend has no
//! circuit; only its probe availability gates it.
//!
//! Every call carries a timeout. A timeout counts as a candidate failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, GenerateOptions, Generation, TextGenerator};
use crate::cache::{CacheKey, CachedCompletion, ResultCache};
use crate::clock::{duration_millis, SharedClock};
use crate::error::{looks_rate_limited, BackendFailure, DispatchError, DispatchResult};

use super::catalog::{canonical_model, Catalog, CatalogEntry};
use super::circuit::{CircuitState, CircuitTable};
use super::registry::{ModelRegistry, TaskHint};
use super::usage::{UsageEvent, UsageTracker};

/// Task kind used when the caller names none
pub const DEFAULT_TASK: &str = "completion";

// ============================================================================
// Requests and Results
// ============================================================================

/// One completion request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Prompt text
    pub prompt: String,
    /// Backend the caller wants tried first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Model the caller wants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion length limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Task kind, part of the cache key
    #[serde(default = "default_task")]
    pub task: String,
}

fn default_task() -> String {
    DEFAULT_TASK.to_string()
}

impl CompletionRequest {
    /// Auto-routed request for a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            backend: None,
            model: None,
            temperature: None,
            max_tokens: None,
            task: default_task(),
        }
    }

    /// Builder: request a backend
    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Builder: request a model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder: set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Builder: set completion length limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Builder: set task kind
    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Generation options for the backend call
    #[must_use]
    pub fn options(&self) -> GenerateOptions {
        let mut opts = GenerateOptions::default();
        if let Some(t) = self.temperature {
            opts = opts.with_temperature(t);
        }
        if let Some(m) = self.max_tokens {
            opts = opts.with_max_tokens(m);
        }
        opts
    }

    /// What the caller targeted, for cache keys and error messages
    #[must_use]
    pub fn target(&self) -> String {
        match (&self.backend, &self.model) {
            (Some(b), Some(m)) => format!("{b}/{m}"),
            (Some(b), None) => b.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => "auto".to_string(),
        }
    }

    /// Cache key for this request
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.prompt, &self.task, &self.target())
    }
}

/// A successful completion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Generated text
    pub text: String,
    /// Backend that produced it
    pub backend: String,
    /// Model that produced it
    pub model: String,
    /// Prompt tokens reported by the backend
    pub tokens_in: u64,
    /// Completion tokens reported by the backend
    pub tokens_out: u64,
    /// Tokens charged (reported, or estimated when unreported)
    pub tokens: u64,
    /// Dollars spent on this call
    pub cost: f64,
    /// Candidates tried, including the successful one (0 for a cache hit)
    pub attempts: u32,
    /// Whether the result came from the cache
    pub cached: bool,
}

impl CompletionResult {
    fn from_cache(hit: CachedCompletion) -> Self {
        Self {
            text: hit.text,
            backend: hit.backend,
            model: hit.model,
            tokens_in: 0,
            tokens_out: 0,
            tokens: hit.tokens,
            cost: 0.0,
            attempts: 0,
            cached: true,
        }
    }
}

/// One entry of a routing plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Backend identifier
    pub backend: String,
    /// Model to request
    pub model: String,
    /// Local or remote
    pub kind: BackendKind,
}

/// Ordered candidates plus failures found while planning
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// Candidates in attempt order
    pub candidates: Vec<Candidate>,
    /// Requested targets that could not be planned
    pub failures: Vec<BackendFailure>,
    /// Requested model or backend the caller named
    pub requested: Option<String>,
    /// The requested backend's circuit is open; fail without fallback
    pub fail_fast: bool,
}

// ============================================================================
// Configuration
// ============================================================================

/// Router timeouts and preferences
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Remote tried right after the local backend
    pub preferred_backend: Option<String>,
    /// Deadline for local calls
    pub local_timeout: Duration,
    /// Deadline for remote calls
    pub remote_timeout: Duration,
    /// How long a rate-limited remote is skipped
    pub rate_limit_cooldown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            preferred_backend: None,
            local_timeout: Duration::from_secs(600),
            remote_timeout: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// Backend Status
// ============================================================================

/// Health label of one backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    /// Usable now
    Available,
    /// Probe failed or no generator registered
    Unavailable,
    /// Circuit open, cooling down
    CircuitOpen,
    /// Provider rate limit, cooling down
    RateLimited,
    /// Turned off in the catalog
    Disabled,
}

impl BackendHealth {
    /// Stable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-backend status line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    /// Backend identifier
    pub id: String,
    /// Health label
    pub status: BackendHealth,
    /// Enabled in the catalog
    pub enabled: bool,
    /// Usable right now
    pub available: bool,
    /// Priority rank
    pub priority: u32,
    /// Whether the backend is free
    pub is_free: bool,
    /// Price per 1000 tokens
    pub price_per_1k: f64,
    /// Installed (local) or default (remote) models
    pub models: Vec<String>,
    /// Circuit state (remotes only)
    pub circuit: Option<CircuitState>,
    /// Successful requests served
    pub usage_count: u64,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Dollars spent
    pub total_cost: f64,
    /// Most recent failure reason
    pub last_error: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

struct LocalSlot {
    generator: Arc<dyn TextGenerator>,
    registry: Arc<ModelRegistry>,
}

/// Routes requests across the catalog
pub struct Router {
    catalog: RwLock<Catalog>,
    config: RouterConfig,
    clock: SharedClock,
    local: Option<LocalSlot>,
    remotes: DashMap<String, Arc<dyn TextGenerator>>,
    circuits: Arc<CircuitTable>,
    cache: Arc<ResultCache>,
    usage: Arc<UsageTracker>,
    preferred: RwLock<Option<String>>,
    /// Rate-limit marks: backend -> millis since epoch when the mark expires
    rate_limited: DashMap<String, i64>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("has_local", &self.local.is_some())
            .field("remotes", &self.remotes.len())
            .field("preferred", &*self.preferred.read())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router with no generators attached
    pub fn new(
        catalog: Catalog,
        config: RouterConfig,
        circuits: Arc<CircuitTable>,
        cache: Arc<ResultCache>,
        usage: Arc<UsageTracker>,
        clock: SharedClock,
    ) -> Self {
        let preferred = config.preferred_backend.clone();
        Self {
            catalog: RwLock::new(catalog),
            config,
            clock,
            local: None,
            remotes: DashMap::new(),
            circuits,
            cache,
            usage,
            preferred: RwLock::new(preferred),
            rate_limited: DashMap::new(),
        }
    }

    /// Builder: attach the local backend and its model registry
    #[must_use]
    pub fn with_local(mut self, generator: Arc<dyn TextGenerator>, registry: Arc<ModelRegistry>) -> Self {
        self.local = Some(LocalSlot {
            generator,
            registry,
        });
        self
    }

    /// Builder: attach a remote generator under its own name
    #[must_use]
    pub fn with_remote(self, generator: Arc<dyn TextGenerator>) -> Self {
        self.register_remote(generator);
        self
    }

    /// Attach or replace a remote generator
    pub fn register_remote(&self, generator: Arc<dyn TextGenerator>) {
        let name = generator.name().to_string();
        if !self.catalog.read().contains(&name) {
            tracing::warn!(backend = %name, "Registered generator has no catalog entry");
        }
        self.remotes.insert(name, generator);
    }

    /// Copy of the catalog
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        self.catalog.read().clone()
    }

    /// Enable or disable a catalog entry
    pub fn set_backend_enabled(&self, id: &str, enabled: bool) -> DispatchResult<()> {
        if self.catalog.write().set_enabled(id, enabled) {
            Ok(())
        } else {
            Err(DispatchError::UnknownBackend(id.to_string()))
        }
    }

    /// Local model registry, if a local backend is attached
    #[must_use]
    pub fn registry(&self) -> Option<&Arc<ModelRegistry>> {
        self.local.as_ref().map(|l| &l.registry)
    }

    /// Circuit table
    #[must_use]
    pub fn circuits(&self) -> &Arc<CircuitTable> {
        &self.circuits
    }

    /// Result cache
    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Usage tracker
    #[must_use]
    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Router settings
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Whether the local backend is attached, enabled and probed available
    #[must_use]
    pub fn local_available(&self) -> bool {
        let enabled = self.catalog.read().local().is_some_and(|e| e.enabled);
        enabled && self.local.as_ref().is_some_and(|l| l.registry.is_available())
    }

    // ------------------------------------------------------------------------
    // Preferences and resets
    // ------------------------------------------------------------------------

    /// Current preferred backend
    #[must_use]
    pub fn preferred_backend(&self) -> Option<String> {
        self.preferred.read().clone()
    }

    /// Set or clear the preferred backend
    pub fn set_preferred_backend(&self, backend: Option<&str>) -> DispatchResult<()> {
        if let Some(id) = backend {
            if !self.catalog.read().contains(id) {
                return Err(DispatchError::UnknownBackend(id.to_string()));
            }
        }
        *self.preferred.write() = backend.map(str::to_string);
        tracing::info!(preferred = ?backend, "Preferred backend updated");
        Ok(())
    }

    /// Clear a backend's circuit, rate-limit mark and last error
    pub fn reset_backend(&self, backend: &str) -> DispatchResult<()> {
        if !self.catalog.read().contains(backend) {
            return Err(DispatchError::UnknownBackend(backend.to_string()));
        }
        self.circuits.reset(backend);
        self.rate_limited.remove(backend);
        self.usage.clear_error(backend);
        tracing::info!(backend = %backend, "Backend reset");
        Ok(())
    }

    /// Whether a backend carries an unexpired rate-limit mark
    #[must_use]
    pub fn is_rate_limited(&self, backend: &str) -> bool {
        self.rate_limited
            .get(backend)
            .is_some_and(|until| *until > self.clock.now_millis())
    }

    /// Skip a backend until the rate-limit cooldown elapses
    pub fn mark_rate_limited(&self, backend: &str) {
        let until = self.clock.now_millis() + duration_millis(self.config.rate_limit_cooldown);
        self.rate_limited.insert(backend.to_string(), until);
        tracing::warn!(
            backend = %backend,
            cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
            "Backend rate limited"
        );
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    /// Probe the local backend if its model list is stale
    pub async fn refresh_local(&self) -> bool {
        match &self.local {
            Some(local) => local.registry.ensure_fresh().await,
            None => false,
        }
    }

    /// Build the ordered candidate list for a request
    ///
    /// Uses the registry as last probed; call [`Router::refresh_local`]
    /// first to honor the refresh interval.
    pub fn plan(&self, request: &CompletionRequest) -> DispatchResult<RoutePlan> {
        let catalog = self.catalog.read().clone();
        let mut plan = RoutePlan {
            requested: (request.backend.is_some() || request.model.is_some()).then(|| request.target()),
            ..Default::default()
        };

        let local_model = self.local_model_for(&catalog, request);

        // Primary candidate from an explicit backend or a model owner
        if let Some(ref backend) = request.backend {
            let entry = catalog
                .get(backend)
                .ok_or_else(|| DispatchError::UnknownBackend(backend.clone()))?;
            self.push_primary(&mut plan, entry, request, local_model.as_deref());
            if plan.fail_fast {
                return Ok(plan);
            }
        } else if let Some(ref model) = request.model {
            let local_hit = self
                .local
                .as_ref()
                .and_then(|l| l.registry.resolve(model));
            if local_hit.is_none() {
                if let Some(entry) = catalog.backend_for_model(model) {
                    self.push_primary(&mut plan, entry, request, None);
                }
            }
        }

        // Local first among the fallbacks
        if let (Some(local), Some(model)) = (catalog.local(), local_model) {
            if self.local_available() {
                push_unique(&mut plan, local, model);
            }
        }

        if let Some(preferred) = self.preferred_backend() {
            if let Some(entry) = catalog.get(&preferred) {
                if entry.kind == BackendKind::Remote && entry.enabled && self.remotes.contains_key(&preferred) {
                    push_unique(&mut plan, entry, entry.default_model.clone());
                }
            }
        }

        for entry in catalog.enabled_remotes_by_price() {
            if self.remotes.contains_key(&entry.id) {
                push_unique(&mut plan, entry, entry.default_model.clone());
            }
        }

        Ok(plan)
    }

    /// Local model for a request: the requested one if installed, else the
    /// best match for the prompt
    fn local_model_for(&self, catalog: &Catalog, request: &CompletionRequest) -> Option<String> {
        let local = self.local.as_ref()?;
        catalog.local().filter(|e| e.enabled)?;
        request
            .model
            .as_deref()
            .and_then(|m| local.registry.resolve(m))
            .or_else(|| match TaskHint::parse(&request.task) {
                TaskHint::General => None,
                hint => local.registry.best_model_for(hint),
            })
            .or_else(|| local.registry.select_for_task(&request.prompt))
    }

    fn push_primary(
        &self,
        plan: &mut RoutePlan,
        entry: &CatalogEntry,
        request: &CompletionRequest,
        local_model: Option<&str>,
    ) {
        match entry.kind {
            BackendKind::Local => match local_model {
                Some(model) if self.local_available() => {
                    push_unique(plan, entry, model.to_string());
                }
                _ => plan.failures.push(BackendFailure::new(
                    &entry.id,
                    request.model.clone(),
                    "local backend unavailable or no model installed",
                )),
            },
            BackendKind::Remote => {
                let model = request
                    .model
                    .as_deref()
                    .map_or_else(|| entry.default_model.clone(), |m| canonical_model(m).into_owned());
                if !entry.enabled {
                    plan.failures
                        .push(BackendFailure::new(&entry.id, Some(model), "backend disabled"));
                } else if request.backend.as_deref() == Some(entry.id.as_str())
                    && self.circuits.is_open(&entry.id)
                {
                    plan.fail_fast = true;
                    plan.failures.push(BackendFailure::new(
                        &entry.id,
                        Some(model),
                        DispatchError::CircuitOpen {
                            backend: entry.id.clone(),
                        }
                        .to_string(),
                    ));
                } else if !self.remotes.contains_key(&entry.id) {
                    plan.failures.push(BackendFailure::new(
                        &entry.id,
                        Some(model),
                        "no generator registered",
                    ));
                } else {
                    push_unique(plan, entry, model);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Serve a request from the cache or dispatch it
    pub async fn complete(&self, request: &CompletionRequest) -> DispatchResult<CompletionResult> {
        if let Some(hit) = self.cached(request) {
            return Ok(hit);
        }
        self.dispatch(request).await
    }

    /// Cached result for a request, if live
    #[must_use]
    pub fn cached(&self, request: &CompletionRequest) -> Option<CompletionResult> {
        let hit = self.cache.get(&request.cache_key())?;
        tracing::debug!(backend = %hit.backend, "Cache hit");
        Some(CompletionResult::from_cache(hit))
    }

    /// Walk the candidate list until one backend answers
    ///
    /// Does not consult the cache but populates it on success.
    pub async fn dispatch(&self, request: &CompletionRequest) -> DispatchResult<CompletionResult> {
        self.refresh_local().await;
        let plan = self.plan(request)?;

        if plan.candidates.is_empty() && plan.failures.is_empty() {
            return Err(DispatchError::NoBackendConfigured);
        }

        let RoutePlan {
            candidates,
            mut failures,
            requested,
            fail_fast,
        } = plan;
        if fail_fast {
            tracing::debug!(target = %request.target(), "Requested backend circuit open, failing fast");
            return Err(DispatchError::AllBackendsFailed {
                requested,
                failures,
            });
        }
        let opts = request.options();
        let mut attempts = 0u32;

        for candidate in candidates {
            if candidate.kind == BackendKind::Remote && self.is_rate_limited(&candidate.backend) {
                tracing::debug!(backend = %candidate.backend, "Skipping rate-limited backend");
                failures.push(BackendFailure::new(
                    candidate.backend,
                    Some(candidate.model),
                    "rate limited, cooling down",
                ));
                continue;
            }

            attempts += 1;
            match self.attempt(&candidate, request, &opts).await {
                Ok(generation) => {
                    return Ok(self.record_success(&candidate, request, generation, attempts));
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        backend = %candidate.backend,
                        model = %candidate.model,
                        error = %reason,
                        "Candidate failed, trying next"
                    );
                    if !matches!(e, DispatchError::CircuitOpen { .. }) {
                        self.usage.record_failure(&candidate.backend, &reason);
                        if candidate.kind == BackendKind::Remote && looks_rate_limited(&reason) {
                            self.mark_rate_limited(&candidate.backend);
                        }
                    }
                    failures.push(BackendFailure::new(
                        candidate.backend,
                        Some(candidate.model),
                        reason,
                    ));
                }
            }
        }

        Err(DispatchError::AllBackendsFailed {
            requested,
            failures,
        })
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        request: &CompletionRequest,
        opts: &GenerateOptions,
    ) -> DispatchResult<Generation> {
        match candidate.kind {
            BackendKind::Local => {
                let local = self.local.as_ref().ok_or_else(|| DispatchError::BackendUnavailable {
                    backend: candidate.backend.clone(),
                    reason: "no local generator attached".to_string(),
                })?;
                call_with_timeout(
                    local.generator.as_ref(),
                    &candidate.backend,
                    &candidate.model,
                    request,
                    opts,
                    self.config.local_timeout,
                )
                .await
            }
            BackendKind::Remote => {
                let generator = self
                    .remotes
                    .get(&candidate.backend)
                    .map(|g| Arc::clone(g.value()))
                    .ok_or_else(|| DispatchError::BackendUnavailable {
                        backend: candidate.backend.clone(),
                        reason: "no generator registered".to_string(),
                    })?;
                let breaker = self.circuits.breaker(&candidate.backend);
                breaker
                    .call(|| {
                        call_with_timeout(
                            generator.as_ref(),
                            &candidate.backend,
                            &candidate.model,
                            request,
                            opts,
                            self.config.remote_timeout,
                        )
                    })
                    .await
            }
        }
    }

    fn record_success(
        &self,
        candidate: &Candidate,
        request: &CompletionRequest,
        generation: Generation,
        attempts: u32,
    ) -> CompletionResult {
        let (is_free, price, baseline) = {
            let catalog = self.catalog.read();
            let entry = catalog.get(&candidate.backend);
            (
                entry.map_or(candidate.kind.is_free(), CatalogEntry::is_free),
                entry.map_or(0.0, |e| e.price_per_1k),
                catalog.savings_baseline_price(),
            )
        };

        let tokens = generation.total_tokens(&request.prompt);
        let cost = self.usage.record_success(UsageEvent {
            backend: &candidate.backend,
            is_free,
            price_per_1k: price,
            tokens,
            baseline_price_per_1k: baseline,
        });

        self.cache.put(
            request.cache_key(),
            CachedCompletion {
                text: generation.text.clone(),
                backend: candidate.backend.clone(),
                model: candidate.model.clone(),
                tokens,
            },
            None,
        );

        tracing::info!(
            backend = %candidate.backend,
            model = %candidate.model,
            tokens,
            cost,
            attempts,
            "Request served"
        );

        CompletionResult {
            text: generation.text,
            backend: candidate.backend.clone(),
            model: candidate.model.clone(),
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            tokens,
            cost,
            attempts,
            cached: false,
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Status of every catalog entry in declaration order
    #[must_use]
    pub fn backend_statuses(&self) -> Vec<BackendStatus> {
        let catalog = self.catalog.read().clone();
        catalog
            .entries()
            .iter()
            .map(|entry| {
                let usage = self.usage.backend_usage(&entry.id);
                let (status, models, circuit) = match entry.kind {
                    BackendKind::Local => {
                        let models = self
                            .local
                            .as_ref()
                            .map(|l| l.registry.model_names())
                            .unwrap_or_default();
                        let status = if !entry.enabled {
                            BackendHealth::Disabled
                        } else if self.local_available() {
                            BackendHealth::Available
                        } else {
                            BackendHealth::Unavailable
                        };
                        (status, models, None)
                    }
                    BackendKind::Remote => {
                        let circuit = self.circuits.get(&entry.id).map(|b| b.state());
                        let status = if !entry.enabled {
                            BackendHealth::Disabled
                        } else if !self.remotes.contains_key(&entry.id) {
                            BackendHealth::Unavailable
                        } else if self.circuits.is_open(&entry.id) {
                            BackendHealth::CircuitOpen
                        } else if self.is_rate_limited(&entry.id) {
                            BackendHealth::RateLimited
                        } else {
                            BackendHealth::Available
                        };
                        (status, vec![entry.default_model.clone()], circuit)
                    }
                };

                BackendStatus {
                    id: entry.id.clone(),
                    status,
                    enabled: entry.enabled,
                    available: status == BackendHealth::Available,
                    priority: entry.priority,
                    is_free: entry.is_free(),
                    price_per_1k: entry.price_per_1k,
                    models,
                    circuit,
                    usage_count: usage.usage_count,
                    tokens_used: usage.tokens_used,
                    total_cost: usage.total_cost,
                    last_error: usage.last_error,
                }
            })
            .collect()
    }
}

fn push_unique(plan: &mut RoutePlan, entry: &CatalogEntry, model: String) {
    if plan.candidates.iter().any(|c| c.backend == entry.id) {
        return;
    }
    plan.candidates.push(Candidate {
        backend: entry.id.clone(),
        model,
        kind: entry.kind,
    });
}

async fn call_with_timeout(
    generator: &dyn TextGenerator,
    backend: &str,
    model: &str,
    request: &CompletionRequest,
    opts: &GenerateOptions,
    after: Duration,
) -> DispatchResult<Generation> {
    match tokio::time::timeout(after, generator.generate(&request.prompt, model, opts)).await {
        Ok(Ok(generation)) => Ok(generation),
        Ok(Err(e)) => Err(DispatchError::BackendUnavailable {
            backend: backend.to_string(),
            reason: format!("{e:#}"),
        }),
        Err(_) => Err(DispatchError::Timeout {
            backend: backend.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelInfo;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::routing::circuit::CircuitConfig;
    use crate::routing::test_utils::{ScriptedBackend, ScriptedLister};
    use crate::routing::catalog::LOCAL_BACKEND;
    use pretty_assertions::assert_eq;

    struct Harness {
        router: Router,
        clock: Arc<ManualClock>,
        local: Arc<ScriptedBackend>,
        lister: Arc<ScriptedLister>,
    }

    fn catalog_with(remotes: &[&str]) -> Catalog {
        let mut catalog = Catalog::builtin();
        for id in remotes {
            catalog.set_enabled(id, true);
        }
        catalog
    }

    fn harness(catalog: Catalog, config: RouterConfig, installed: Vec<ModelInfo>) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let lister = Arc::new(ScriptedLister::new(installed));
        let registry = Arc::new(ModelRegistry::new(
            lister.clone(),
            Duration::from_secs(300),
            clock.clone(),
        ));
        let local = Arc::new(ScriptedBackend::new(LOCAL_BACKEND));
        let router = Router::new(
            catalog,
            config,
            Arc::new(CircuitTable::new(
                CircuitConfig {
                    failure_threshold: 2,
                    cooldown: Duration::from_secs(60),
                },
                clock.clone(),
            )),
            Arc::new(ResultCache::new(CacheConfig::default(), clock.clone())),
            Arc::new(UsageTracker::new(clock.clone())),
            clock.clone(),
        )
        .with_local(local.clone(), registry);
        Harness {
            router,
            clock,
            local,
            lister,
        }
    }

    fn llama() -> Vec<ModelInfo> {
        vec![ModelInfo::new("llama3.2:3b", 2_000_000_000)]
    }

    #[tokio::test]
    async fn test_local_is_first_when_available() {
        let openai = Arc::new(ScriptedBackend::new("openai"));
        let h = harness(catalog_with(&["openai"]), RouterConfig::default(), llama());
        let router = h.router.with_remote(openai.clone());

        let result = router.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, LOCAL_BACKEND);
        assert_eq!(result.model, "llama3.2:3b");
        assert_eq!(result.cost, 0.0);
        assert_eq!(openai.calls(), 0);
        assert_eq!(router.usage().snapshot(true).free_requests, 1);
    }

    #[tokio::test]
    async fn test_paid_only_when_local_unreachable() {
        let openai = Arc::new(ScriptedBackend::new("openai").with_tokens(500, 500));
        let h = harness(catalog_with(&["openai"]), RouterConfig::default(), llama());
        h.lister.set_failing(true);
        let router = h.router.with_remote(openai.clone());

        let result = router.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, "openai");
        assert_eq!(result.model, "gpt-3.5-turbo");
        assert!((result.cost - 0.03).abs() < 1e-9);

        let usage = router.usage().snapshot(false);
        assert_eq!(usage.paid_requests, 1);
        assert_eq!(usage.free_requests, 0);
        assert_eq!(h.local.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_after_local_failure() {
        let anthropic = Arc::new(ScriptedBackend::new("anthropic"));
        let h = harness(catalog_with(&["anthropic"]), RouterConfig::default(), llama());
        h.local.set_failure(Some("model crashed".to_string()));
        let router = h.router.with_remote(anthropic.clone());

        let result = router.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, "anthropic");
        assert_eq!(result.attempts, 2);
        assert_eq!(
            router.usage().backend_usage(LOCAL_BACKEND).last_error.as_deref(),
            Some("backend ollama unavailable: model crashed")
        );
    }

    #[tokio::test]
    async fn test_local_failures_never_open_a_circuit() {
        let h = harness(catalog_with(&[]), RouterConfig::default(), llama());
        h.local.set_failure(Some("model crashed".to_string()));

        for _ in 0..5 {
            let err = h.router.complete(&CompletionRequest::new("hello")).await.unwrap_err();
            assert!(matches!(err, DispatchError::AllBackendsFailed { .. }));
        }
        assert_eq!(h.local.calls(), 5);
        assert!(h.router.circuits().get(LOCAL_BACKEND).is_none());

        h.local.set_failure(None);
        let result = h.router.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, LOCAL_BACKEND);
        assert_eq!(h.local.calls(), 6);
        assert!(h.router.circuits().get(LOCAL_BACKEND).is_none());
    }

    #[tokio::test]
    async fn test_task_hint_picks_local_model() {
        let installed = vec![
            ModelInfo::new("llama3.2:3b", 2_000_000_000),
            ModelInfo::new("qwen2.5-coder:7b", 4_700_000_000),
        ];
        let h = harness(catalog_with(&[]), RouterConfig::default(), installed);

        let plain = h.router.complete(&CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(plain.model, "llama3.2:3b");

        let code = h
            .router
            .complete(&CompletionRequest::new("hi").with_task("code review"))
            .await
            .unwrap();
        assert_eq!(code.model, "qwen2.5-coder:7b");

        let long_prompt = "describe the history of the printing press ".repeat(20);
        let fast = h
            .router
            .complete(&CompletionRequest::new(long_prompt).with_task("quick answer"))
            .await
            .unwrap();
        assert_eq!(fast.model, "llama3.2:3b");
    }

    #[tokio::test]
    async fn test_remotes_ordered_by_price_with_preference_first() {
        let h = harness(
            catalog_with(&["openai", "google", "anthropic"]),
            RouterConfig {
                preferred_backend: Some("openai".to_string()),
                ..Default::default()
            },
            Vec::new(),
        );
        let router = h
            .router
            .with_remote(Arc::new(ScriptedBackend::new("openai")))
            .with_remote(Arc::new(ScriptedBackend::new("google")))
            .with_remote(Arc::new(ScriptedBackend::new("anthropic")));
        router.refresh_local().await;

        let plan = router.plan(&CompletionRequest::new("hello")).unwrap();
        let order: Vec<&str> = plan.candidates.iter().map(|c| c.backend.as_str()).collect();
        assert_eq!(order, vec!["openai", "google", "anthropic"]);

        router.set_preferred_backend(None).unwrap();
        let plan = router.plan(&CompletionRequest::new("hello")).unwrap();
        let order: Vec<&str> = plan.candidates.iter().map(|c| c.backend.as_str()).collect();
        assert_eq!(order, vec!["google", "anthropic", "openai"]);
    }

    #[tokio::test]
    async fn test_explicit_backend_goes_first() {
        let h = harness(catalog_with(&["xai"]), RouterConfig::default(), llama());
        let xai = Arc::new(ScriptedBackend::new("xai"));
        let router = h.router.with_remote(xai.clone());

        let result = router
            .complete(&CompletionRequest::new("hello").with_backend("xai"))
            .await
            .unwrap();
        assert_eq!(result.backend, "xai");
        assert_eq!(h.local.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_name_routes_to_owner() {
        let h = harness(catalog_with(&["google", "anthropic"]), RouterConfig::default(), llama());
        let anthropic = Arc::new(ScriptedBackend::new("anthropic"));
        let router = h
            .router
            .with_remote(Arc::new(ScriptedBackend::new("google")))
            .with_remote(anthropic.clone());

        let result = router
            .complete(&CompletionRequest::new("hello").with_model("claude-3-opus"))
            .await
            .unwrap();
        assert_eq!(result.backend, "anthropic");
        assert_eq!(anthropic.models_seen(), vec!["claude-opus-4-1-20250805"]);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_rejected() {
        let h = harness(Catalog::builtin(), RouterConfig::default(), llama());
        let err = h
            .router
            .complete(&CompletionRequest::new("hello").with_backend("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownBackend(ref b) if b == "nope"));
    }

    #[tokio::test]
    async fn test_unresolvable_model_tries_best_local_match() {
        let h = harness(Catalog::builtin(), RouterConfig::default(), llama());
        h.local.set_failure(Some("out of memory".to_string()));

        let err = h
            .router
            .complete(&CompletionRequest::new("hello").with_model("no-such-model"))
            .await
            .unwrap_err();

        assert_eq!(h.local.models_seen(), vec!["llama3.2:3b"]);
        let message = err.to_string();
        assert!(message.contains("no-such-model"), "{message}");
        assert!(message.contains("out of memory"), "{message}");
    }

    #[tokio::test]
    async fn test_open_circuit_skips_without_invocation() {
        let openai = Arc::new(ScriptedBackend::failing("openai", "HTTP 500"));
        let h = harness(catalog_with(&["openai"]), RouterConfig::default(), Vec::new());
        h.lister.set_failing(true);
        let router = h.router.with_remote(openai.clone());
        let request = CompletionRequest::new("hello");

        for _ in 0..2 {
            assert!(router.dispatch(&request).await.is_err());
        }
        assert_eq!(openai.calls(), 2);
        assert!(router.circuits().is_open("openai"));

        let err = router.dispatch(&request).await.unwrap_err();
        assert_eq!(openai.calls(), 2);
        assert!(err.to_string().contains("circuit open"));

        h.clock.advance(Duration::from_secs(61));
        openai.set_failure(None);
        let result = router.dispatch(&request).await.unwrap();
        assert_eq!(result.backend, "openai");
        assert!(!router.circuits().is_open("openai"));
    }

    #[tokio::test]
    async fn test_requested_backend_with_open_circuit_fails_fast() {
        let openai = Arc::new(ScriptedBackend::new("openai"));
        let h = harness(catalog_with(&["openai"]), RouterConfig::default(), llama());
        let router = h.router.with_remote(openai.clone());
        router.circuits().breaker("openai").force_state(CircuitState::Open);

        let err = router
            .complete(&CompletionRequest::new("hello").with_backend("openai"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AllBackendsFailed { ref failures, .. } if failures.len() == 1));
        assert_eq!(openai.calls(), 0);
        assert_eq!(h.local.calls(), 0);

        let auto = router.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(auto.backend, LOCAL_BACKEND);
    }

    #[tokio::test]
    async fn test_rate_limit_marks_and_reset_clears() {
        let google = Arc::new(ScriptedBackend::new("google").then_fail("429 Too Many Requests"));
        let openai = Arc::new(ScriptedBackend::new("openai"));
        let h = harness(catalog_with(&["google", "openai"]), RouterConfig::default(), Vec::new());
        h.lister.set_failing(true);
        let router = h.router.with_remote(google.clone()).with_remote(openai.clone());

        let first = router.dispatch(&CompletionRequest::new("a")).await.unwrap();
        assert_eq!(first.backend, "openai");
        assert!(router.is_rate_limited("google"));

        let second = router.dispatch(&CompletionRequest::new("b")).await.unwrap();
        assert_eq!(second.backend, "openai");
        assert_eq!(google.calls(), 1);

        router.reset_backend("google").unwrap();
        assert!(!router.is_rate_limited("google"));
        let third = router.dispatch(&CompletionRequest::new("c")).await.unwrap();
        assert_eq!(third.backend, "google");
    }

    #[tokio::test]
    async fn test_timeout_advances_to_next_candidate() {
        let slow = Arc::new(ScriptedBackend::new("google").with_delay(Duration::from_millis(500)));
        let h = harness(
            catalog_with(&["google", "openai"]),
            RouterConfig {
                remote_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Vec::new(),
        );
        h.lister.set_failing(true);
        let router = h
            .router
            .with_remote(slow)
            .with_remote(Arc::new(ScriptedBackend::new("openai")));

        let result = router.dispatch(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(result.backend, "openai");
        assert!(router
            .usage()
            .backend_usage("google")
            .last_error
            .is_some_and(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn test_nothing_configured() {
        let h = harness(Catalog::builtin(), RouterConfig::default(), Vec::new());
        h.lister.set_failing(true);
        let err = h.router.complete(&CompletionRequest::new("hello")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoBackendConfigured));
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let h = harness(Catalog::builtin(), RouterConfig::default(), llama());
        let request = CompletionRequest::new("explain   lifetimes");

        let first = h.router.complete(&request).await.unwrap();
        let second = h
            .router
            .complete(&CompletionRequest::new("explain lifetimes"))
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, first.text);
        assert_eq!(h.local.calls(), 1);
    }

    #[tokio::test]
    async fn test_status_labels() {
        let h = harness(catalog_with(&["openai", "xai"]), RouterConfig::default(), llama());
        let router = h.router.with_remote(Arc::new(ScriptedBackend::new("openai")));
        router.refresh_local().await;
        router.circuits().breaker("openai").force_state(CircuitState::Open);

        let statuses = router.backend_statuses();
        let label = |id: &str| {
            statuses
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.status)
                .unwrap()
        };
        assert_eq!(label(LOCAL_BACKEND), BackendHealth::Available);
        assert_eq!(label("openai"), BackendHealth::CircuitOpen);
        assert_eq!(label("xai"), BackendHealth::Unavailable);
        assert_eq!(label("google"), BackendHealth::Disabled);
        assert!(router.set_preferred_backend(Some("bogus")).is_err());
    }
}
