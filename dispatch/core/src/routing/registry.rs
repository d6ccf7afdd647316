//! Local Model Registry and Capability Probe
//!
//! Tracks which models the local backend has installed. The list is
//! refreshed from the backend's listing endpoint, lazily when a lookup finds
//! it older than the refresh interval, or periodically via
//! [`ModelRegistry::spawn_refresher`].
//!
//! A failed probe marks the local backend unavailable but keeps the last
//! known model list. An unreachable local backend is never fatal; it only
//! drops out of candidate lists.
//!
//! # Name Resolution
//!
//! [`resolve_model`] maps a requested name onto an installed one using a
//! fixed rule order:
//!
//! 1. normalize: lowercase, trim, strip `ollama/`, `ollama:`, `local/`, `local:`
//! 2. exact match
//! 3. name + `:latest`
//! 4. base-name prefix (`llama3.2` matches `llama3.2:3b`)
//! 5. punctuation-insensitive fuzzy match (ignoring `.`, `-`, `_`)

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::backend::{ModelInfo, ModelLister};
use crate::clock::{duration_millis, SharedClock};

use super::catalog::Capability;

/// Prompts shorter than this (in chars) go to the smallest model
pub const SHORT_PROMPT_CHARS: usize = 50;

/// Prompts longer than this (in chars) go to the largest model
pub const LONG_PROMPT_CHARS: usize = 200;

const NAME_PREFIXES: &[&str] = &["ollama/", "ollama:", "local/", "local:"];

const CODE_KEYWORDS: &[&str] = &[
    "code",
    "function",
    "class",
    "def ",
    "import",
    "programming",
    "script",
];

/// An installed local model with derived capability tags
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalModel {
    /// Listing metadata
    #[serde(flatten)]
    pub info: ModelInfo,
    /// Tags derived from the model name
    pub capabilities: Vec<Capability>,
}

impl LocalModel {
    /// Wrap listing metadata, deriving capabilities
    #[must_use]
    pub fn from_info(info: ModelInfo) -> Self {
        let capabilities = detect_capabilities(&info.name);
        Self { info, capabilities }
    }

    /// Model name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether the model carries a capability tag
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Task hints for [`ModelRegistry::best_model_for`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskHint {
    /// Code generation or review
    Code,
    /// Image understanding
    Vision,
    /// Quick answers, smallest model
    Fast,
    /// Anything else
    General,
}

impl TaskHint {
    /// Parse a free-form task description
    #[must_use]
    pub fn parse(task: &str) -> Self {
        let task = task.to_lowercase();
        if task.contains("code") || task.contains("programming") {
            Self::Code
        } else if task.contains("vision") || task.contains("image") {
            Self::Vision
        } else if task.contains("fast") || task.contains("quick") {
            Self::Fast
        } else {
            Self::General
        }
    }
}

/// Derive capability tags from a model name
#[must_use]
pub fn detect_capabilities(name: &str) -> Vec<Capability> {
    let lower = name.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let mut caps = Vec::new();
    if any(&["code", "coder", "starcoder"]) {
        caps.push(Capability::Code);
    }
    if any(&["vision", "llava", "bakllava", "moondream"]) {
        caps.push(Capability::Vision);
    }
    let embedding = any(&["embed", "bge", "nomic"]);
    if embedding {
        caps.push(Capability::Embedding);
    } else {
        caps.push(Capability::Chat);
    }
    if any(&["32k", "64k", "128k", "100k"]) {
        caps.push(Capability::LargeContext);
    }
    if any(&["qwen", "yi", "solar", "gemma"]) {
        caps.push(Capability::Multilingual);
    }
    caps.sort();
    caps
}

/// Lowercase, trim and strip known routing prefixes
#[must_use]
pub fn normalize_model_name(name: &str) -> String {
    let mut clean = name.trim().to_lowercase();
    for prefix in NAME_PREFIXES {
        if let Some(rest) = clean.strip_prefix(prefix) {
            clean = rest.to_string();
        }
    }
    clean
}

fn strip_punctuation(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, '.' | '-' | '_')).collect()
}

fn base_name(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

/// Resolve `requested` against installed model names
///
/// Returns the installed name, or `None` when nothing matches. Rules are
/// applied in the fixed order documented on this module; within a rule the
/// first installed model in listing order wins.
#[must_use]
pub fn resolve_model<'a, I>(installed: I, requested: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let installed: Vec<&str> = installed.into_iter().collect();
    if installed.is_empty() {
        return None;
    }

    let clean = normalize_model_name(requested);
    if clean.is_empty() {
        return None;
    }

    if let Some(exact) = installed.iter().find(|m| m.eq_ignore_ascii_case(&clean)) {
        return Some((*exact).to_string());
    }

    let latest = format!("{clean}:latest");
    if let Some(tagged) = installed.iter().find(|m| m.eq_ignore_ascii_case(&latest)) {
        return Some((*tagged).to_string());
    }

    let base = base_name(&clean);
    let tagged_prefix = format!("{base}:");
    if let Some(prefixed) = installed.iter().find(|m| {
        let lower = m.to_lowercase();
        lower.starts_with(&tagged_prefix) || lower == base
    }) {
        return Some((*prefixed).to_string());
    }

    let fuzzy = strip_punctuation(&clean);
    if fuzzy.is_empty() {
        return None;
    }
    let stripped: Vec<(&str, String)> = installed
        .iter()
        .map(|m| (*m, strip_punctuation(&m.to_lowercase())))
        .collect();

    stripped
        .iter()
        .find(|(_, s)| *s == fuzzy || strip_punctuation(base_name(s)) == fuzzy)
        .or_else(|| stripped.iter().find(|(_, s)| s.contains(&fuzzy)))
        .or_else(|| {
            stripped.iter().find(|(_, s)| {
                let installed_base = base_name(s);
                !installed_base.is_empty() && fuzzy.contains(installed_base)
            })
        })
        .map(|(name, _)| (*name).to_string())
}

/// Pick a model for a prompt from installed models
///
/// Short prompts get the smallest model, code prompts a code-tuned model,
/// long prompts the largest model, anything else the first installed model.
#[must_use]
pub fn select_for_prompt(models: &[LocalModel], prompt: &str) -> Option<String> {
    let first = models.first()?;
    let chars = prompt.chars().count();

    if chars < SHORT_PROMPT_CHARS {
        return smallest(models).map(|m| m.name().to_string());
    }

    let lower = prompt.to_lowercase();
    if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        if let Some(code) = code_model(models) {
            return Some(code.name().to_string());
        }
    }

    if chars > LONG_PROMPT_CHARS {
        return largest(models).map(|m| m.name().to_string());
    }

    Some(first.name().to_string())
}

fn smallest(models: &[LocalModel]) -> Option<&LocalModel> {
    models.iter().min_by_key(|m| m.info.size)
}

fn largest(models: &[LocalModel]) -> Option<&LocalModel> {
    // rev() so ties keep the earliest listed model
    models.iter().rev().max_by_key(|m| m.info.size)
}

fn code_model(models: &[LocalModel]) -> Option<&LocalModel> {
    models
        .iter()
        .find(|m| m.name().to_lowercase().contains("codellama"))
        .or_else(|| models.iter().find(|m| m.has(Capability::Code)))
}

#[derive(Debug, Default)]
struct RegistryState {
    models: Vec<LocalModel>,
    available: bool,
    last_refresh: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Point-in-time view of the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Whether the last probe succeeded
    pub available: bool,
    /// Installed models as of the last successful probe
    pub models: Vec<LocalModel>,
    /// Time of the last successful probe
    pub last_refresh: Option<DateTime<Utc>>,
    /// Error from the last failed probe
    pub last_error: Option<String>,
}

/// Registry of installed local models
pub struct ModelRegistry {
    lister: Arc<dyn ModelLister>,
    clock: SharedClock,
    refresh_interval: Duration,
    state: RwLock<RegistryState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ModelRegistry")
            .field("refresh_interval", &self.refresh_interval)
            .field("available", &state.available)
            .field("models", &state.models.len())
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Create a registry. No probe happens until the first lookup or refresh.
    pub fn new(lister: Arc<dyn ModelLister>, refresh_interval: Duration, clock: SharedClock) -> Self {
        Self {
            lister,
            clock,
            refresh_interval,
            state: RwLock::new(RegistryState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether the model list is older than the refresh interval
    #[must_use]
    pub fn is_stale(&self) -> bool {
        match self.state.read().last_refresh {
            None => true,
            Some(at) => {
                self.clock.now_millis() - at.timestamp_millis()
                    > duration_millis(self.refresh_interval)
            }
        }
    }

    /// Probe the local backend
    ///
    /// Without `force`, returns the cached availability when the list is
    /// still fresh. Returns whether the local backend is available.
    pub async fn refresh(&self, force: bool) -> bool {
        let _guard = self.refresh_lock.lock().await;
        if !force && !self.is_stale() {
            return self.is_available();
        }

        match self.lister.list_models().await {
            Ok(listed) => {
                let models: Vec<LocalModel> = listed.into_iter().map(LocalModel::from_info).collect();
                tracing::info!(
                    count = models.len(),
                    models = %models.iter().map(LocalModel::name).collect::<Vec<_>>().join(", "),
                    "Local backend probe succeeded"
                );
                let mut state = self.state.write();
                state.models = models;
                state.available = true;
                state.last_refresh = Some(self.clock.now());
                state.last_error = None;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Local backend probe failed, keeping previous model list");
                let mut state = self.state.write();
                state.available = false;
                state.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Refresh only if the list is stale
    pub async fn ensure_fresh(&self) -> bool {
        if self.is_stale() {
            self.refresh(false).await
        } else {
            self.is_available()
        }
    }

    /// Whether the last probe succeeded
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.read().available
    }

    /// Installed models
    #[must_use]
    pub fn models(&self) -> Vec<LocalModel> {
        self.state.read().models.clone()
    }

    /// Installed model names in listing order
    #[must_use]
    pub fn model_names(&self) -> Vec<String> {
        self.state
            .read()
            .models
            .iter()
            .map(|m| m.info.name.clone())
            .collect()
    }

    /// Resolve a requested name against the current list
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        let state = self.state.read();
        resolve_model(state.models.iter().map(LocalModel::name), name)
    }

    /// Pick a model for a prompt
    #[must_use]
    pub fn select_for_task(&self, prompt: &str) -> Option<String> {
        select_for_prompt(&self.state.read().models, prompt)
    }

    /// Best installed model for a task hint
    #[must_use]
    pub fn best_model_for(&self, hint: TaskHint) -> Option<String> {
        let state = self.state.read();
        let models = &state.models;
        let pick = match hint {
            TaskHint::Code => models
                .iter()
                .find(|m| m.has(Capability::Code))
                .or_else(|| {
                    models.iter().find(|m| {
                        let lower = m.name().to_lowercase();
                        lower.contains("llama") || lower.contains("qwen")
                    })
                })
                .or_else(|| models.first()),
            TaskHint::Vision => models.iter().find(|m| m.has(Capability::Vision)),
            TaskHint::Fast => smallest(models),
            TaskHint::General => models.first(),
        };
        pick.map(|m| m.name().to_string())
    }

    /// Snapshot of the registry state
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        RegistrySnapshot {
            available: state.available,
            models: state.models.clone(),
            last_refresh: state.last_refresh,
            last_error: state.last_error.clone(),
        }
    }

    /// Run the probe on a timer until the registry is dropped
    pub fn spawn_refresher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    tracing::debug!("Model registry dropped, stopping refresher");
                    break;
                };
                registry.refresh(true).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::routing::test_utils::ScriptedLister;
    use pretty_assertions::assert_eq;

    fn models(names: &[(&str, u64)]) -> Vec<LocalModel> {
        names
            .iter()
            .map(|(n, s)| LocalModel::from_info(ModelInfo::new(*n, *s)))
            .collect()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    #[test]
    fn test_resolve_exact_and_prefix_stripping() {
        let installed = ["llama3.2:3b", "qwen2.5-coder:7b"];
        assert_eq!(
            resolve_model(installed, "llama3.2:3b"),
            Some("llama3.2:3b".to_string())
        );
        assert_eq!(
            resolve_model(installed, "ollama/qwen2.5-coder:7b"),
            Some("qwen2.5-coder:7b".to_string())
        );
        assert_eq!(
            resolve_model(installed, "  LOCAL:Llama3.2:3B "),
            Some("llama3.2:3b".to_string())
        );
    }

    #[test]
    fn test_resolve_latest_tag() {
        let installed = ["mistral:7b", "mistral:latest"];
        assert_eq!(
            resolve_model(installed, "mistral"),
            Some("mistral:latest".to_string())
        );
    }

    #[test]
    fn test_resolve_base_name_prefix() {
        let installed = ["phi3:mini", "llama3.2:3b"];
        assert_eq!(
            resolve_model(installed, "llama3.2"),
            Some("llama3.2:3b".to_string())
        );
        assert_eq!(
            resolve_model(installed, "llama3.2:70b"),
            Some("llama3.2:3b".to_string())
        );
    }

    #[test]
    fn test_resolve_fuzzy_punctuation() {
        let installed = ["llama3.2:3b", "qwen2.5-coder:7b"];
        assert_eq!(
            resolve_model(installed, "llama32"),
            Some("llama3.2:3b".to_string())
        );
        assert_eq!(
            resolve_model(installed, "qwen25_coder"),
            Some("qwen2.5-coder:7b".to_string())
        );
    }

    #[test]
    fn test_resolve_not_found() {
        let installed = ["llama3.2:3b"];
        assert_eq!(resolve_model(installed, "nonexistent-model-xyz"), None);
        assert_eq!(resolve_model(Vec::<&str>::new(), "llama3.2"), None);
        assert_eq!(resolve_model(installed, "ollama/"), None);
    }

    // =========================================================================
    // Selection
    // =========================================================================

    #[test]
    fn test_select_short_prompt_smallest() {
        let m = models(&[("llama3.2:3b", 2_000), ("phi3:mini", 1_000), ("big:70b", 9_000)]);
        assert_eq!(select_for_prompt(&m, "hi"), Some("phi3:mini".to_string()));
    }

    #[test]
    fn test_select_code_prompt() {
        let m = models(&[("llama3.2:3b", 2_000), ("qwen2.5-coder:7b", 5_000)]);
        let prompt = "Please write a function that parses a config file and returns a map";
        assert_eq!(
            select_for_prompt(&m, prompt),
            Some("qwen2.5-coder:7b".to_string())
        );
    }

    #[test]
    fn test_select_long_prompt_largest() {
        let m = models(&[("llama3.2:3b", 2_000), ("mixtral:8x7b", 26_000)]);
        let prompt = "Explain the history of the Roman republic in detail. ".repeat(5);
        assert_eq!(
            select_for_prompt(&m, &prompt),
            Some("mixtral:8x7b".to_string())
        );
    }

    #[test]
    fn test_select_default_first() {
        let m = models(&[("llama3.2:3b", 2_000), ("mixtral:8x7b", 26_000)]);
        let prompt = "Summarize the main arguments of this essay about urban planning.";
        assert_eq!(select_for_prompt(&m, prompt), Some("llama3.2:3b".to_string()));
        assert_eq!(select_for_prompt(&[], prompt), None);
    }

    #[test]
    fn test_capabilities_from_name() {
        assert_eq!(
            detect_capabilities("deepseek-coder:6.7b"),
            vec![Capability::Code, Capability::Chat]
        );
        assert_eq!(
            detect_capabilities("nomic-embed-text"),
            vec![Capability::Embedding]
        );
        assert_eq!(
            detect_capabilities("llava:13b"),
            vec![Capability::Vision, Capability::Chat]
        );
        assert!(detect_capabilities("qwen2.5:7b").contains(&Capability::Multilingual));
    }

    #[test]
    fn test_task_hint_parse() {
        assert_eq!(TaskHint::parse("code review"), TaskHint::Code);
        assert_eq!(TaskHint::parse("Image captioning"), TaskHint::Vision);
        assert_eq!(TaskHint::parse("quick answer"), TaskHint::Fast);
        assert_eq!(TaskHint::parse("summarize"), TaskHint::General);
    }

    // =========================================================================
    // Registry
    // =========================================================================

    #[tokio::test]
    async fn test_refresh_replaces_list() {
        let lister = Arc::new(ScriptedLister::new(vec![
            ModelInfo::new("llama3.2:3b", 2_000),
            ModelInfo::new("llava:7b", 4_000),
        ]));
        let clock = Arc::new(ManualClock::starting_now());
        let registry = ModelRegistry::new(lister.clone(), Duration::from_secs(300), clock);

        assert!(registry.is_stale());
        assert!(registry.refresh(false).await);
        assert_eq!(registry.model_names(), vec!["llama3.2:3b", "llava:7b"]);
        assert_eq!(registry.best_model_for(TaskHint::Vision), Some("llava:7b".to_string()));
        assert_eq!(lister.calls(), 1);
    }

    #[tokio::test]
    async fn test_lazy_refresh_respects_interval() {
        let lister = Arc::new(ScriptedLister::new(vec![ModelInfo::new("llama3.2:3b", 1)]));
        let clock = Arc::new(ManualClock::starting_now());
        let registry = ModelRegistry::new(lister.clone(), Duration::from_secs(300), clock.clone());

        registry.ensure_fresh().await;
        registry.ensure_fresh().await;
        assert_eq!(lister.calls(), 1);

        clock.advance(Duration::from_secs(301));
        registry.ensure_fresh().await;
        assert_eq!(lister.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_stale_list() {
        let lister = Arc::new(ScriptedLister::new(vec![ModelInfo::new("llama3.2:3b", 1)]));
        let clock = Arc::new(ManualClock::starting_now());
        let registry = ModelRegistry::new(lister.clone(), Duration::from_secs(300), clock);

        assert!(registry.refresh(true).await);
        lister.set_failing(true);
        assert!(!registry.refresh(true).await);

        assert!(!registry.is_available());
        assert_eq!(registry.model_names(), vec!["llama3.2:3b"]);
        assert!(registry.snapshot().last_error.is_some());
        assert_eq!(registry.resolve("llama3.2"), Some("llama3.2:3b".to_string()));
    }

    #[tokio::test]
    async fn test_fast_hint_picks_smallest() {
        let lister = Arc::new(ScriptedLister::new(vec![
            ModelInfo::new("phi3:mini", 2 * 1024 * 1024 * 1024),
            ModelInfo::new("mixtral:8x7b", 26 * 1024 * 1024 * 1024),
        ]));
        let registry = ModelRegistry::new(
            lister,
            Duration::from_secs(300),
            Arc::new(ManualClock::starting_now()),
        );
        registry.refresh(true).await;

        assert_eq!(registry.best_model_for(TaskHint::Fast), Some("phi3:mini".to_string()));
    }
}
