//! Per-Backend Circuit Breaker
//!
//! Isolates remote backends that keep failing. The local backend is never
//! registered here; only its availability flag gates it.
//!
//! ```text
//! +--------+   N consecutive failures   +------+      cooldown       +-----------+
//! | Closed | -------------------------> | Open | ------------------> | Half-Open |
//! +--------+                            +------+                     +-----------+
//!     ^                                    ^           failure            |
//!     |                                    +------------------------------+
//!     |                      success                                      |
//!     +-------------------------------------------------------------------+
//! ```
//!
//! - **Closed**: requests allowed, failures counted
//! - **Open**: requests rejected without invoking the backend
//! - **Half-Open**: cooldown elapsed, the next outcome decides
//!
//! State lives in atomics; transitions use compare-and-set so concurrent
//! jobs sharing a backend agree on a single transition.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{duration_millis, SharedClock};
use crate::error::{DispatchError, DispatchResult};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting requests until cooldown elapses
    Open,
    /// Cooldown elapsed, probing recovery
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => CLOSED,
            Self::Open => OPEN,
            Self::HalfOpen => HALF_OPEN,
        }
    }

    /// Stable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Circuit breaker thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects requests
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker for one backend
pub struct CircuitBreaker {
    backend: String,
    config: CircuitConfig,
    clock: SharedClock,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since epoch of the last transition to open (0 = never)
    opened_at_ms: AtomicI64,
    /// Millis since epoch of the last failure (0 = never)
    last_failure_ms: AtomicI64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(backend: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            backend: backend.into(),
            config,
            clock,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            last_failure_ms: AtomicI64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Backend this breaker guards
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Stored state, without evaluating cooldown
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failure count
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        self.clock.now_millis() - opened_at >= duration_millis(self.config.cooldown)
    }

    /// Whether the breaker is open and still cooling down
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open && !self.cooldown_elapsed()
    }

    /// Whether a request may proceed
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open here.
    pub fn allows_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed() {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::info!(backend = %self.backend, "Circuit breaker transitioning to half-open");
                }
                true
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous != CLOSED {
            tracing::info!(backend = %self.backend, "Circuit breaker closed, backend recovered");
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures < self.config.failure_threshold {
                    return;
                }
                // opened_at must be visible before the state flips to open
                self.opened_at_ms.store(now, Ordering::Release);
                if self
                    .state
                    .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(
                        backend = %self.backend,
                        consecutive_failures = failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.opened_at_ms.store(now, Ordering::Release);
                if self
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(backend = %self.backend, "Circuit breaker reopened after failed probe");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker
    ///
    /// Fails with [`DispatchError::CircuitOpen`] without invoking `f` while
    /// the breaker is open; otherwise records the outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<DispatchError>,
    {
        if !self.allows_request() {
            return Err(DispatchError::CircuitOpen {
                backend: self.backend.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e.into())
            }
        }
    }

    /// Return to closed with counters cleared
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
        tracing::info!(backend = %self.backend, "Circuit breaker reset");
    }

    /// Force a state (admin and tests)
    pub fn force_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::Release);
        if state == CircuitState::Open {
            self.opened_at_ms
                .store(self.clock.now_millis(), Ordering::Release);
        }
        if state == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// Restore persisted state
    pub fn restore(&self, snapshot: &CircuitSnapshot) {
        self.state
            .store(snapshot.state.as_u8(), Ordering::Release);
        self.consecutive_failures
            .store(snapshot.consecutive_failures, Ordering::Release);
        self.opened_at_ms.store(
            snapshot.opened_at.map_or(0, |t| t.timestamp_millis()),
            Ordering::Release,
        );
        self.last_failure_ms.store(
            snapshot.last_failure.map_or(0, |t| t.timestamp_millis()),
            Ordering::Release,
        );
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let ts = |ms: i64| {
            if ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(ms).single()
            }
        };
        CircuitSnapshot {
            backend: self.backend.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.config.failure_threshold,
            cooldown_secs: self.config.cooldown.as_secs(),
            opened_at: ts(self.opened_at_ms.load(Ordering::Acquire)),
            last_failure: ts(self.last_failure_ms.load(Ordering::Acquire)),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

/// Persistable breaker state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Backend identifier
    pub backend: String,
    /// Stored state
    pub state: CircuitState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Configured threshold
    pub failure_threshold: u32,
    /// Configured cooldown in seconds
    pub cooldown_secs: u64,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the last failure happened
    pub last_failure: Option<DateTime<Utc>>,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Requests rejected while open
    pub total_rejections: u64,
}

/// Breakers for every remote backend
pub struct CircuitTable {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitConfig,
    clock: SharedClock,
}

impl CircuitTable {
    /// Create an empty table
    #[must_use]
    pub fn new(config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Configuration applied to new breakers
    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get a breaker if registered
    #[must_use]
    pub fn get(&self, backend: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend).map(|b| Arc::clone(b.value()))
    }

    /// Get or create the breaker for a backend
    pub fn breaker(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(backend) {
            return existing;
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    backend,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Whether the backend's breaker is open and cooling down
    #[must_use]
    pub fn is_open(&self, backend: &str) -> bool {
        self.get(backend).is_some_and(|b| b.is_open())
    }

    /// Reset one backend's breaker
    pub fn reset(&self, backend: &str) {
        if let Some(breaker) = self.get(backend) {
            breaker.reset();
        }
    }

    /// Restore persisted snapshots
    pub fn restore(&self, snapshots: &[CircuitSnapshot]) {
        for snapshot in snapshots {
            self.breaker(&snapshot.backend).restore(snapshot);
        }
    }

    /// Snapshots of every breaker, sorted by backend
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }
}

impl std::fmt::Debug for CircuitTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitTable")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}
