//! Backend Traits
//!
//! Every backend, local or remote, is reached through one closed interface:
//! [`TextGenerator::generate`]. The router never inspects a backend beyond
//! that call; which concrete generator serves a candidate is decided by the
//! catalog's [`BackendKind`] tag.
//!
//! The local backend additionally implements [`ModelLister`] so the registry
//! can probe which models are installed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Whether a backend runs locally for free or is a paid remote service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local, free backend (Ollama). Never circuit-gated.
    Local,
    /// Paid remote backend. Circuit-gated and rate-limit aware.
    Remote,
}

impl BackendKind {
    /// Whether requests on this kind are free
    #[must_use]
    pub fn is_free(self) -> bool {
        matches!(self, Self::Local)
    }
}

/// Per-call generation options
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature (0.0-1.0)
    pub temperature: Option<f32>,
    /// Maximum tokens in the response
    pub max_tokens: Option<u32>,
}

impl GenerateOptions {
    /// Set temperature, clamped to 0.0-1.0
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Result of one successful `generate` call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Generated text
    pub text: String,
    /// Prompt tokens as reported by the backend (0 if unknown)
    pub tokens_in: u64,
    /// Completion tokens as reported by the backend (0 if unknown)
    pub tokens_out: u64,
}

impl Generation {
    /// Generation with unknown token counts
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    /// Total tokens, estimating from word counts when the backend reported none
    #[must_use]
    pub fn total_tokens(&self, prompt: &str) -> u64 {
        let reported = self.tokens_in + self.tokens_out;
        if reported > 0 {
            reported
        } else {
            estimate_tokens(prompt) + estimate_tokens(&self.text)
        }
    }
}

/// Rough token estimate: whitespace-separated words
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Metadata about an installed local model
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier, e.g. `llama3.2:3b`
    pub name: String,
    /// Size on disk in bytes
    pub size: u64,
    /// Last modification timestamp as reported
    pub modified: Option<String>,
    /// Model family
    pub family: Option<String>,
    /// Parameter count, e.g. `3.2B`
    pub parameter_size: Option<String>,
    /// Quantization level, e.g. `Q4_K_M`
    pub quantization: Option<String>,
}

impl ModelInfo {
    /// Model with only a name and size
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Default::default()
        }
    }
}

/// Text generation backend
///
/// Implement this for each concrete backend kind. Implementations handle
/// wire formats and authentication; the router handles timeouts, retries
/// and fallback.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend identifier (e.g. "ollama", "openai")
    fn name(&self) -> &str;

    /// Generate a completion for `prompt` with `model`
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: &GenerateOptions,
    ) -> anyhow::Result<Generation>;
}

/// Lists installed models on a local backend
#[async_trait]
pub trait ModelLister: Send + Sync {
    /// List installed models
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;
}

/// Connection settings for the local backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalBackendConfig {
    /// Whether the local backend participates in routing
    pub enabled: bool,
    /// Ollama host address
    pub host: String,
    /// Ollama port number
    pub port: u16,
    /// How often the installed-model list is refreshed
    pub refresh_interval: Duration,
    /// Per-call generation timeout
    pub timeout: Duration,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 11434,
            refresh_interval: Duration::from_secs(300),
            timeout: Duration::from_secs(600),
        }
    }
}

impl LocalBackendConfig {
    /// Create configuration for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Create configuration from `OLLAMA_HOST` / `OLLAMA_PORT`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.host = host;
        }
        if let Some(port) = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.port = port;
        }
        config
    }

    /// Base URL of the Ollama HTTP API
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}
