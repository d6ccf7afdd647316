//! Scripted Backends for Tests
//!
//! In-process stand-ins for the backend collaborators, so routing, circuit
//! and batch behavior can be exercised without a network.
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_core::routing::test_utils::ScriptedBackend;
//!
//! let openai = ScriptedBackend::new("openai").then_fail("HTTP 500");
//!
//! // First call fails, every later call answers
//! assert_eq!(openai.calls(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{GenerateOptions, Generation, ModelInfo, ModelLister, TextGenerator};

// ============================================================================
// Scripted Generator
// ============================================================================

/// One scripted reaction
#[derive(Clone, Debug)]
enum Step {
    Reply(String),
    Fail(String),
}

/// A `TextGenerator` whose answers are scripted
///
/// Queued steps are consumed first; afterwards the backend either echoes
/// the prompt or, when a permanent failure is set, fails every call.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    permanent_failure: Mutex<Option<String>>,
    delay: Duration,
    tokens: Option<(u64, u64)>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    models_seen: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// A backend that always answers
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Mutex::new(VecDeque::new()),
            permanent_failure: Mutex::new(None),
            delay: Duration::ZERO,
            tokens: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            models_seen: Mutex::new(Vec::new()),
        }
    }

    /// A backend that fails every call with `reason`
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let backend = Self::new(name);
        backend.set_failure(Some(reason.into()));
        backend
    }

    /// Builder: queue one successful reply
    #[must_use]
    pub fn then_reply(self, text: impl Into<String>) -> Self {
        self.steps.lock().push_back(Step::Reply(text.into()));
        self
    }

    /// Builder: queue one failure
    #[must_use]
    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        self.steps.lock().push_back(Step::Fail(reason.into()));
        self
    }

    /// Builder: wait this long inside every call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Builder: report these token counts instead of leaving them unknown
    #[must_use]
    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens = Some((tokens_in, tokens_out));
        self
    }

    /// Set or clear a permanent failure
    pub fn set_failure(&self, reason: Option<String>) {
        *self.permanent_failure.lock() = reason;
    }

    /// Number of `generate` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Models requested, in call order
    pub fn models_seen(&self) -> Vec<String> {
        self.models_seen.lock().clone()
    }

    fn next_step(&self, prompt: &str) -> Step {
        if let Some(step) = self.steps.lock().pop_front() {
            return step;
        }
        match self.permanent_failure.lock().clone() {
            Some(reason) => Step::Fail(reason),
            None => Step::Reply(format!("{}: {}", self.name, prompt)),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TextGenerator for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        _opts: &GenerateOptions,
    ) -> anyhow::Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models_seen.lock().push(model.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_step(prompt) {
            Step::Reply(text) => {
                let mut generation = Generation::text(text);
                if let Some((tokens_in, tokens_out)) = self.tokens {
                    generation.tokens_in = tokens_in;
                    generation.tokens_out = tokens_out;
                }
                Ok(generation)
            }
            Step::Fail(reason) => anyhow::bail!(reason),
        }
    }
}

// ============================================================================
// Scripted Lister
// ============================================================================

/// A `ModelLister` returning a fixed list, or failing on demand
#[derive(Debug)]
pub struct ScriptedLister {
    models: Mutex<Vec<ModelInfo>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedLister {
    /// Lister reporting `models`
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self {
            models: Mutex::new(models),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Lister whose backend is unreachable
    pub fn unreachable() -> Self {
        let lister = Self::new(Vec::new());
        lister.set_failing(true);
        lister
    }

    /// Replace the reported list
    pub fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.lock() = models;
    }

    /// Make probes fail or succeed
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of probes so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLister for ScriptedLister {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(self.models.lock().clone())
    }
}
