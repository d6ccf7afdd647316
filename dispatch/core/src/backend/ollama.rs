//! Ollama Backend Implementation
//!
//! The local, free backend. Talks to an Ollama server over its REST API:
//! - `/api/generate` - non-streaming completions
//! - `/api/tags` - installed models, used by the capability probe

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    GenerateOptions, Generation, LocalBackendConfig, ModelInfo, ModelLister, TextGenerator,
};

/// Timeout for the installed-model listing
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client with a default timeout
///
/// Every request also sets its own timeout, so the plain client used when
/// the builder fails still honours the configured deadline.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Generation timeout
    timeout: Duration,
    /// Base URL derived from host and port
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(&LocalBackendConfig::new(host, port))
    }

    /// Create from [`LocalBackendConfig`]
    #[must_use]
    pub fn from_config(config: &LocalBackendConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
            base_url: config.base_url(),
            http_client: http_client(config.timeout),
        }
    }

    /// Create from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_config(&LocalBackendConfig::from_env())
    }

    /// Host this backend talks to
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this backend talks to
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn request_body(prompt: &str, model: &str, opts: &GenerateOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });

        let mut options = serde_json::Map::new();
        if let Some(temperature) = opts.temperature {
            options.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = opts.max_tokens {
            options.insert("num_predict".to_string(), serde_json::json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }

    fn parse_model(entry: &serde_json::Value) -> Option<ModelInfo> {
        let name = entry.get("name")?.as_str()?.to_string();
        if name.is_empty() {
            return None;
        }
        let details = entry.get("details");
        let detail = |key: &str| {
            details
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        Some(ModelInfo {
            name,
            size: entry
                .get("size")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
            modified: entry
                .get("modified_at")
                .and_then(|v| v.as_str())
                .map(String::from),
            family: detail("family"),
            parameter_size: detail("parameter_size"),
            quantization: detail("quantization_level"),
        })
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

#[async_trait]
impl TextGenerator for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        opts: &GenerateOptions,
    ) -> anyhow::Result<Generation> {
        let response = self
            .http_client
            .post(self.generate_url())
            .timeout(self.timeout)
            .json(&Self::request_body(prompt, model, opts))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let text = data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();
        let count = |key: &str| data.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);

        Ok(Generation {
            text,
            tokens_in: count("prompt_eval_count"),
            tokens_out: count("eval_count"),
        })
    }
}

#[async_trait]
impl ModelLister for OllamaBackend {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(TAGS_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| arr.iter().filter_map(Self::parse_model).collect())
            .unwrap_or_default();

        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_backend_creation() {
        let backend = OllamaBackend::new("localhost", 11434);
        assert_eq!(backend.host(), "localhost");
        assert_eq!(backend.port(), 11434);
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(backend.tags_url(), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_request_body_options() {
        let body = OllamaBackend::request_body("Hi", "llama3.2", &GenerateOptions::default());
        assert_eq!(body["stream"], serde_json::json!(false));
        assert!(body.get("options").is_none());

        let opts = GenerateOptions::default()
            .with_temperature(0.2)
            .with_max_tokens(64);
        let body = OllamaBackend::request_body("Hi", "llama3.2", &opts);
        assert_eq!(body["options"]["num_predict"], serde_json::json!(64));
        assert!(body["options"]["temperature"].is_number());
    }

    #[test]
    fn test_parse_model_details() {
        let entry = serde_json::json!({
            "name": "qwen2.5-coder:7b",
            "size": 4_700_000_000_u64,
            "modified_at": "2025-01-01T00:00:00Z",
            "details": {
                "family": "qwen2",
                "parameter_size": "7.6B",
                "quantization_level": "Q4_K_M"
            }
        });

        let model = OllamaBackend::parse_model(&entry).unwrap();
        assert_eq!(model.name, "qwen2.5-coder:7b");
        assert_eq!(model.size, 4_700_000_000);
        assert_eq!(model.family.as_deref(), Some("qwen2"));
        assert_eq!(model.parameter_size.as_deref(), Some("7.6B"));
        assert_eq!(model.quantization.as_deref(), Some("Q4_K_M"));
    }

    #[test]
    fn test_parse_model_skips_nameless() {
        assert!(OllamaBackend::parse_model(&serde_json::json!({"size": 1})).is_none());
        assert!(OllamaBackend::parse_model(&serde_json::json!({"name": ""})).is_none());
    }
}
