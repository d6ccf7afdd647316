//! Backend Catalog
//!
//! Static description of every backend the router knows about: the local
//! Ollama backend plus the paid remote providers, each with its price per
//! 1000 tokens, priority rank, default model and the model-name patterns
//! that route a requested model to it.
//!
//! Remote entries start disabled. They are enabled when their API key
//! variable is present or when configuration says so.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Identifier of the local backend
pub const LOCAL_BACKEND: &str = "ollama";

/// Fallback price used for savings when no paid backend is configured
pub const DEFAULT_BASELINE_PRICE_PER_1K: f64 = 0.001;

/// Capability tags shared by catalog entries and local models
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Code generation and review
    Code,
    /// Image understanding
    Vision,
    /// General conversation
    Chat,
    /// Embedding generation
    Embedding,
    /// Long context windows
    LargeContext,
    /// Non-English languages
    Multilingual,
}

impl Capability {
    /// Stable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Vision => "vision",
            Self::Chat => "chat",
            Self::Embedding => "embedding",
            Self::LargeContext => "large_context",
            Self::Multilingual => "multilingual",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a model name is matched to a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum ModelPattern {
    /// Lowercased model name contains the needle
    Contains(String),
    /// Lowercased model name starts with the needle
    Prefix(String),
}

impl ModelPattern {
    fn contains(needle: &str) -> Self {
        Self::Contains(needle.to_string())
    }

    fn prefix(needle: &str) -> Self {
        Self::Prefix(needle.to_string())
    }

    /// Whether `model` (already lowercased) matches
    #[must_use]
    pub fn matches(&self, model: &str) -> bool {
        match self {
            Self::Contains(needle) => model.contains(needle.as_str()),
            Self::Prefix(needle) => model.starts_with(needle.as_str()),
        }
    }
}

/// One backend known to the router
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Backend identifier
    pub id: String,
    /// Local or remote
    pub kind: BackendKind,
    /// Price in dollars per 1000 tokens (0 for local)
    pub price_per_1k: f64,
    /// Priority rank (lower is tried earlier among equals)
    pub priority: u32,
    /// Whether the backend may be used at all
    pub enabled: bool,
    /// Model used when the caller did not pick one for this backend
    pub default_model: String,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Model-name patterns routed to this backend
    pub model_patterns: Vec<ModelPattern>,
    /// Capability tags
    pub capabilities: Vec<Capability>,
}

impl CatalogEntry {
    /// The local Ollama entry
    #[must_use]
    pub fn local() -> Self {
        Self {
            id: LOCAL_BACKEND.to_string(),
            kind: BackendKind::Local,
            price_per_1k: 0.0,
            priority: 1,
            enabled: true,
            default_model: "llama3.2".to_string(),
            api_key_env: None,
            model_patterns: Vec::new(),
            capabilities: vec![Capability::Chat, Capability::Code],
        }
    }

    /// A remote entry, disabled until configured
    pub fn remote(
        id: impl Into<String>,
        price_per_1k: f64,
        priority: u32,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::Remote,
            price_per_1k,
            priority,
            enabled: false,
            default_model: default_model.into(),
            api_key_env: None,
            model_patterns: Vec::new(),
            capabilities: vec![Capability::Chat],
        }
    }

    /// Builder: set the API key variable
    #[must_use]
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    /// Builder: set model patterns
    #[must_use]
    pub fn with_patterns(mut self, patterns: Vec<ModelPattern>) -> Self {
        self.model_patterns = patterns;
        self
    }

    /// Builder: set capability tags
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Builder: set enabled
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether this backend is free to use
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind.is_free()
    }

    /// Whether `model` routes to this backend
    #[must_use]
    pub fn owns_model(&self, model: &str) -> bool {
        let lower = model.to_lowercase();
        self.model_patterns.iter().any(|p| p.matches(&lower))
    }

    /// Whether the API key variable is set and non-empty
    #[must_use]
    pub fn has_api_key_in_env(&self) -> bool {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .is_some_and(|v| !v.trim().is_empty())
    }
}

/// Per-remote overrides from configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Backend identifier the overrides apply to
    pub id: String,
    /// Enable or disable the backend
    pub enabled: Option<bool>,
    /// Override price per 1000 tokens
    pub price_per_1k: Option<f64>,
    /// Override priority rank
    pub priority: Option<u32>,
    /// Override default model
    pub default_model: Option<String>,
}

/// The set of backends the router may use
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// Catalog with no backends
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Local Ollama plus the known remote providers (remotes disabled)
    #[must_use]
    pub fn builtin() -> Self {
        use Capability::{Chat, Code, LargeContext, Multilingual, Vision};

        let entries = vec![
            CatalogEntry::local(),
            CatalogEntry::remote("anthropic", 0.015, 10, "claude-3-haiku-20240307")
                .with_api_key_env("ANTHROPIC_API_KEY")
                .with_patterns(vec![
                    ModelPattern::contains("claude"),
                    ModelPattern::contains("opus"),
                    ModelPattern::contains("sonnet"),
                ])
                .with_capabilities(vec![Chat, Code, Vision, LargeContext]),
            CatalogEntry::remote("openai", 0.03, 11, "gpt-3.5-turbo")
                .with_api_key_env("OPENAI_API_KEY")
                .with_patterns(vec![
                    ModelPattern::prefix("gpt"),
                    ModelPattern::prefix("o3"),
                    ModelPattern::contains("davinci"),
                ])
                .with_capabilities(vec![Chat, Code, Vision]),
            CatalogEntry::remote("google", 0.001, 12, "gemini-2.5-pro")
                .with_api_key_env("GEMINI_API_KEY")
                .with_patterns(vec![
                    ModelPattern::contains("gemini"),
                    ModelPattern::contains("bison"),
                ])
                .with_capabilities(vec![Chat, Vision, LargeContext, Multilingual]),
            CatalogEntry::remote("xai", 0.02, 13, "grok-1")
                .with_api_key_env("XAI_API_KEY")
                .with_patterns(vec![ModelPattern::contains("grok")]),
            CatalogEntry::remote("perplexity", 0.005, 14, "pplx-7b-online")
                .with_api_key_env("PERPLEXITY_API_KEY")
                .with_patterns(vec![
                    ModelPattern::contains("pplx"),
                    ModelPattern::contains("sonar"),
                ]),
        ];

        Self { entries }
    }

    /// Builder: add an entry, replacing any with the same id
    #[must_use]
    pub fn with_entry(mut self, entry: CatalogEntry) -> Self {
        self.upsert(entry);
        self
    }

    /// Add an entry, replacing any with the same id
    pub fn upsert(&mut self, entry: CatalogEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Enable every remote whose API key variable is set
    pub fn enable_from_env(&mut self) {
        for entry in &mut self.entries {
            if entry.kind == BackendKind::Remote && entry.has_api_key_in_env() {
                entry.enabled = true;
            }
        }
    }

    /// Apply configuration overrides. Unknown ids are ignored.
    pub fn apply_settings(&mut self, settings: &[RemoteSettings]) {
        for setting in settings {
            let Some(entry) = self.entries.iter_mut().find(|e| e.id == setting.id) else {
                tracing::warn!(backend = %setting.id, "Ignoring settings for unknown backend");
                continue;
            };
            if let Some(enabled) = setting.enabled {
                entry.enabled = enabled;
            }
            if let Some(price) = setting.price_per_1k {
                entry.price_per_1k = price;
            }
            if let Some(priority) = setting.priority {
                entry.priority = priority;
            }
            if let Some(ref model) = setting.default_model {
                entry.default_model.clone_from(model);
            }
        }
    }

    /// Enable or disable a backend by id
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Look up a backend
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Whether a backend id is known
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All entries in declaration order
    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// The local backend entry, if present
    #[must_use]
    pub fn local(&self) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.kind == BackendKind::Local)
    }

    /// Enabled remote entries ordered by ascending price, then priority
    #[must_use]
    pub fn enabled_remotes_by_price(&self) -> Vec<&CatalogEntry> {
        let mut remotes: Vec<&CatalogEntry> = self
            .entries
            .iter()
            .filter(|e| e.kind == BackendKind::Remote && e.enabled)
            .collect();
        remotes.sort_by(|a, b| {
            a.price_per_1k
                .total_cmp(&b.price_per_1k)
                .then(a.priority.cmp(&b.priority))
        });
        remotes
    }

    /// Enabled remote backend owning `model` by name pattern
    #[must_use]
    pub fn backend_for_model(&self, model: &str) -> Option<&CatalogEntry> {
        let model = canonical_model(model);
        self.entries
            .iter()
            .filter(|e| e.kind == BackendKind::Remote && e.enabled)
            .find(|e| e.owns_model(&model))
    }

    /// Cheapest price among enabled paid backends
    #[must_use]
    pub fn cheapest_paid_price(&self) -> Option<f64> {
        self.entries
            .iter()
            .filter(|e| e.enabled && !e.is_free() && e.price_per_1k > 0.0)
            .map(|e| e.price_per_1k)
            .min_by(f64::total_cmp)
    }

    /// Price used as the savings baseline for free usage
    #[must_use]
    pub fn savings_baseline_price(&self) -> f64 {
        self.cheapest_paid_price()
            .unwrap_or(DEFAULT_BASELINE_PRICE_PER_1K)
    }
}

/// Map retired model names to their current equivalents
#[must_use]
pub fn canonical_model(name: &str) -> Cow<'_, str> {
    const ALIASES: &[(&str, &str)] = &[
        ("gemini-pro", "gemini-2.5-pro"),
        ("gemini-pro-vision", "gemini-2.5-flash"),
        ("claude-3-opus", "claude-opus-4-1-20250805"),
        ("claude-3-sonnet", "claude-sonnet-4"),
        ("gpt-4-vision-preview", "gpt-4o"),
    ];

    ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
        .map_or(Cow::Borrowed(name), |(_, current)| Cow::Borrowed(*current))
}
