//! Usage and Cost Tracking
//!
//! Running counters updated after every dispatch outcome: request and token
//! totals split by free/paid, money spent, money saved, per-backend usage
//! and per-day totals.
//!
//! Dollar amounts are accumulated as integer nano-dollars in atomics so
//! concurrent jobs never lose an update.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

const NANOS_PER_DOLLAR: f64 = 1_000_000_000.0;

fn to_nanos(dollars: f64) -> u64 {
    if dollars <= 0.0 {
        0
    } else {
        (dollars * NANOS_PER_DOLLAR).round() as u64
    }
}

fn to_dollars(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_DOLLAR
}

/// Cost of `tokens` at `price_per_1k`
#[must_use]
pub fn cost_for(tokens: u64, price_per_1k: f64) -> f64 {
    (tokens as f64 / 1000.0) * price_per_1k
}

/// One successful dispatch, as reported to the tracker
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsageEvent<'a> {
    /// Backend that served the request
    pub backend: &'a str,
    /// Whether that backend is free
    pub is_free: bool,
    /// Backend price per 1000 tokens
    pub price_per_1k: f64,
    /// Tokens consumed (reported or estimated)
    pub tokens: u64,
    /// Price used to value free usage
    pub baseline_price_per_1k: f64,
}

#[derive(Debug, Default)]
struct BackendCounters {
    usage_count: AtomicU64,
    failure_count: AtomicU64,
    tokens: AtomicU64,
    cost_nanos: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Default)]
struct DayCounters {
    requests: AtomicU64,
    free_requests: AtomicU64,
    paid_requests: AtomicU64,
    tokens: AtomicU64,
    cost_nanos: AtomicU64,
    saved_nanos: AtomicU64,
}

/// Per-backend usage view
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendUsage {
    /// Backend identifier
    pub backend: String,
    /// Successful requests served
    pub usage_count: u64,
    /// Failed attempts
    pub failure_count: u64,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Dollars spent
    pub total_cost: f64,
    /// Most recent failure reason
    pub last_error: Option<String>,
}

/// Per-day usage view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Calendar day (UTC)
    pub date: NaiveDate,
    /// Successful requests
    pub requests: u64,
    /// Requests served for free
    pub free_requests: u64,
    /// Requests served by paid backends
    pub paid_requests: u64,
    /// Tokens consumed
    pub tokens: u64,
    /// Dollars spent
    pub cost: f64,
    /// Dollars saved
    pub saved: f64,
}

/// Global usage view
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Successful requests
    pub total_requests: u64,
    /// Requests served by the free backend
    pub free_requests: u64,
    /// Requests served by paid backends
    pub paid_requests: u64,
    /// Tokens across all backends
    pub total_tokens: u64,
    /// Tokens on the free backend
    pub free_tokens: u64,
    /// Tokens on paid backends
    pub paid_tokens: u64,
    /// Dollars spent on paid backends
    pub paid_cost: f64,
    /// Dollars saved by using the free backend
    pub cost_saved: f64,
    /// Share of requests served for free (0-100)
    pub free_usage_percentage: f64,
    /// Human-readable advice
    pub recommendation: String,
}

/// Everything the tracker knows, for persistence
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageExport {
    /// Global counters
    pub global: UsageSnapshot,
    /// Per-backend counters
    pub backends: Vec<BackendUsage>,
    /// Per-day counters
    pub daily: Vec<DailyUsage>,
}

/// Usage and cost tracker
#[derive(Debug)]
pub struct UsageTracker {
    clock: SharedClock,
    total_requests: AtomicU64,
    free_requests: AtomicU64,
    paid_requests: AtomicU64,
    free_tokens: AtomicU64,
    paid_tokens: AtomicU64,
    paid_cost_nanos: AtomicU64,
    saved_nanos: AtomicU64,
    backends: DashMap<String, BackendCounters>,
    daily: DashMap<NaiveDate, DayCounters>,
}

impl UsageTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            total_requests: AtomicU64::new(0),
            free_requests: AtomicU64::new(0),
            paid_requests: AtomicU64::new(0),
            free_tokens: AtomicU64::new(0),
            paid_tokens: AtomicU64::new(0),
            paid_cost_nanos: AtomicU64::new(0),
            saved_nanos: AtomicU64::new(0),
            backends: DashMap::new(),
            daily: DashMap::new(),
        }
    }

    /// Record a successful dispatch, returning its cost in dollars
    ///
    /// Free usage is credited as savings valued at
    /// `event.baseline_price_per_1k`: the cheapest configured paid backend,
    /// whether or not that backend was ever used. This can overstate real
    /// savings and is kept as documented behavior.
    pub fn record_success(&self, event: UsageEvent<'_>) -> f64 {
        let today = self.clock.now().date_naive();
        let day = self.daily.entry(today).or_default();
        day.requests.fetch_add(1, Ordering::Relaxed);
        day.tokens.fetch_add(event.tokens, Ordering::Relaxed);

        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let cost = if event.is_free {
            let saved = to_nanos(cost_for(event.tokens, event.baseline_price_per_1k));
            self.free_requests.fetch_add(1, Ordering::Relaxed);
            self.free_tokens.fetch_add(event.tokens, Ordering::Relaxed);
            self.saved_nanos.fetch_add(saved, Ordering::Relaxed);
            day.free_requests.fetch_add(1, Ordering::Relaxed);
            day.saved_nanos.fetch_add(saved, Ordering::Relaxed);
            0.0
        } else {
            let cost = cost_for(event.tokens, event.price_per_1k);
            let nanos = to_nanos(cost);
            self.paid_requests.fetch_add(1, Ordering::Relaxed);
            self.paid_tokens.fetch_add(event.tokens, Ordering::Relaxed);
            self.paid_cost_nanos.fetch_add(nanos, Ordering::Relaxed);
            day.paid_requests.fetch_add(1, Ordering::Relaxed);
            day.cost_nanos.fetch_add(nanos, Ordering::Relaxed);
            cost
        };
        drop(day);

        let backend = self.backends.entry(event.backend.to_string()).or_default();
        backend.usage_count.fetch_add(1, Ordering::Relaxed);
        backend.tokens.fetch_add(event.tokens, Ordering::Relaxed);
        backend
            .cost_nanos
            .fetch_add(to_nanos(cost), Ordering::Relaxed);

        cost
    }

    /// Record a failed attempt on a backend
    pub fn record_failure(&self, backend: &str, reason: &str) {
        let counters = self.backends.entry(backend.to_string()).or_default();
        counters.failure_count.fetch_add(1, Ordering::Relaxed);
        *counters.last_error.lock() = Some(reason.to_string());
    }

    /// Clear a backend's last error
    pub fn clear_error(&self, backend: &str) {
        if let Some(counters) = self.backends.get(backend) {
            *counters.last_error.lock() = None;
        }
    }

    /// Dollars saved so far
    #[must_use]
    pub fn cost_saved(&self) -> f64 {
        to_dollars(self.saved_nanos.load(Ordering::Relaxed))
    }

    /// Dollars spent so far
    #[must_use]
    pub fn paid_cost(&self) -> f64 {
        to_dollars(self.paid_cost_nanos.load(Ordering::Relaxed))
    }

    /// Usage for one backend
    #[must_use]
    pub fn backend_usage(&self, backend: &str) -> BackendUsage {
        self.backends
            .get(backend)
            .map(|c| Self::backend_view(backend, &c))
            .unwrap_or_else(|| BackendUsage {
                backend: backend.to_string(),
                ..Default::default()
            })
    }

    fn backend_view(backend: &str, c: &BackendCounters) -> BackendUsage {
        BackendUsage {
            backend: backend.to_string(),
            usage_count: c.usage_count.load(Ordering::Relaxed),
            failure_count: c.failure_count.load(Ordering::Relaxed),
            tokens_used: c.tokens.load(Ordering::Relaxed),
            total_cost: to_dollars(c.cost_nanos.load(Ordering::Relaxed)),
            last_error: c.last_error.lock().clone(),
        }
    }

    /// Per-day usage, oldest first
    #[must_use]
    pub fn daily(&self) -> Vec<DailyUsage> {
        let mut days: Vec<DailyUsage> = self
            .daily
            .iter()
            .map(|e| {
                let c = e.value();
                DailyUsage {
                    date: *e.key(),
                    requests: c.requests.load(Ordering::Relaxed),
                    free_requests: c.free_requests.load(Ordering::Relaxed),
                    paid_requests: c.paid_requests.load(Ordering::Relaxed),
                    tokens: c.tokens.load(Ordering::Relaxed),
                    cost: to_dollars(c.cost_nanos.load(Ordering::Relaxed)),
                    saved: to_dollars(c.saved_nanos.load(Ordering::Relaxed)),
                }
            })
            .collect();
        days.sort_by_key(|d| d.date);
        days
    }

    /// Global counters plus a recommendation
    ///
    /// `local_available` tunes the recommendation text.
    #[must_use]
    pub fn snapshot(&self, local_available: bool) -> UsageSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let free_requests = self.free_requests.load(Ordering::Relaxed);
        let free_tokens = self.free_tokens.load(Ordering::Relaxed);
        let paid_tokens = self.paid_tokens.load(Ordering::Relaxed);
        let paid_cost = self.paid_cost();
        let cost_saved = self.cost_saved();

        let free_usage_percentage = if total_requests == 0 {
            0.0
        } else {
            free_requests as f64 / total_requests as f64 * 100.0
        };

        let recommendation = if total_requests == 0 {
            "No usage yet. Ollama is recommended for free operation.".to_string()
        } else if !local_available {
            format!("Install Ollama to save ${paid_cost:.4} on future requests!")
        } else if free_requests == total_requests {
            format!("Great! Using 100% free Ollama. Saved ${cost_saved:.4} so far!")
        } else {
            format!(
                "Using Ollama {free_usage_percentage:.1}% of the time. Increase usage to save more!"
            )
        };

        UsageSnapshot {
            total_requests,
            free_requests,
            paid_requests: self.paid_requests.load(Ordering::Relaxed),
            total_tokens: free_tokens + paid_tokens,
            free_tokens,
            paid_tokens,
            paid_cost,
            cost_saved,
            free_usage_percentage,
            recommendation,
        }
    }

    /// Everything, for persistence
    #[must_use]
    pub fn export(&self, local_available: bool) -> UsageExport {
        let mut backends: Vec<BackendUsage> = self
            .backends
            .iter()
            .map(|e| Self::backend_view(e.key(), e.value()))
            .collect();
        backends.sort_by(|a, b| a.backend.cmp(&b.backend));

        UsageExport {
            global: self.snapshot(local_available),
            backends,
            daily: self.daily(),
        }
    }

    /// Load counters from a previous export, adding to current values
    pub fn import(&self, export: &UsageExport) {
        let g = &export.global;
        self.total_requests
            .fetch_add(g.total_requests, Ordering::Relaxed);
        self.free_requests.fetch_add(g.free_requests, Ordering::Relaxed);
        self.paid_requests.fetch_add(g.paid_requests, Ordering::Relaxed);
        self.free_tokens.fetch_add(g.free_tokens, Ordering::Relaxed);
        self.paid_tokens.fetch_add(g.paid_tokens, Ordering::Relaxed);
        self.paid_cost_nanos
            .fetch_add(to_nanos(g.paid_cost), Ordering::Relaxed);
        self.saved_nanos
            .fetch_add(to_nanos(g.cost_saved), Ordering::Relaxed);

        for b in &export.backends {
            let counters = self.backends.entry(b.backend.clone()).or_default();
            counters.usage_count.fetch_add(b.usage_count, Ordering::Relaxed);
            counters
                .failure_count
                .fetch_add(b.failure_count, Ordering::Relaxed);
            counters.tokens.fetch_add(b.tokens_used, Ordering::Relaxed);
            counters
                .cost_nanos
                .fetch_add(to_nanos(b.total_cost), Ordering::Relaxed);
            let mut last_error = counters.last_error.lock();
            if last_error.is_none() {
                last_error.clone_from(&b.last_error);
            }
        }

        for d in &export.daily {
            let day = self.daily.entry(d.date).or_default();
            day.requests.fetch_add(d.requests, Ordering::Relaxed);
            day.free_requests.fetch_add(d.free_requests, Ordering::Relaxed);
            day.paid_requests.fetch_add(d.paid_requests, Ordering::Relaxed);
            day.tokens.fetch_add(d.tokens, Ordering::Relaxed);
            day.cost_nanos.fetch_add(to_nanos(d.cost), Ordering::Relaxed);
            day.saved_nanos.fetch_add(to_nanos(d.saved), Ordering::Relaxed);
        }
    }
}
