//! TOML Configuration File Support
//!
//! Centralized configuration loading for the dispatcher, with an optional
//! TOML file at `~/.config/ai-dispatch/dispatch.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [local]
//! host = "localhost"
//! port = 11434
//! refresh_interval_secs = 300
//! timeout_secs = 600
//!
//! [routing]
//! preferred_backend = "anthropic"
//! remote_timeout_secs = 60
//! rate_limit_cooldown_secs = 300
//!
//! [circuit]
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [cache]
//! ttl_secs = 86400
//!
//! [batch]
//! parallelism = 5
//!
//! [webhooks]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [store]
//! dir = "/var/lib/ai-dispatch"
//!
//! [[remote]]
//! id = "openai"
//! price_per_1k = 0.03
//! enabled = false
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::LocalBackendConfig;
use crate::batch::{DEFAULT_PARALLELISM, MAX_PARALLELISM};
use crate::cache::CacheConfig;
use crate::notify::WebhookConfig;
use crate::routing::{Catalog, CircuitConfig, RemoteSettings, RouterConfig, LOCAL_BACKEND};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the last applied configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Local backend section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalToml {
    /// Ollama host
    pub host: Option<String>,

    /// Ollama port
    pub port: Option<u16>,

    /// Model list refresh interval in seconds
    pub refresh_interval_secs: Option<u64>,

    /// Generation timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Whether the local backend participates in routing
    pub enabled: Option<bool>,
}

/// Routing section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Remote tried right after the local backend
    pub preferred_backend: Option<String>,

    /// Remote call timeout in seconds
    pub remote_timeout_secs: Option<u64>,

    /// How long a rate-limited remote is skipped, in seconds
    pub rate_limit_cooldown_secs: Option<u64>,
}

/// Circuit breaker section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitToml {
    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,

    /// Open-circuit cooldown in seconds
    pub cooldown_secs: Option<u64>,
}

/// Cache section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Entry time-to-live in seconds
    pub ttl_secs: Option<u64>,

    /// Whether results are cached
    pub enabled: Option<bool>,
}

/// Batch section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchToml {
    /// Default batch parallelism
    pub parallelism: Option<usize>,
}

/// Webhook section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksToml {
    /// Delivery attempts per listener
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Persistence section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Directory for JSON records (in-memory when unset)
    pub dir: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Local backend section
    pub local: LocalToml,

    /// Routing section
    pub routing: RoutingToml,

    /// Circuit breaker section
    pub circuit: CircuitToml,

    /// Cache section
    pub cache: CacheToml,

    /// Batch section
    pub batch: BatchToml,

    /// Webhook section
    pub webhooks: WebhooksToml,

    /// Persistence section
    pub store: StoreToml,

    /// Per-remote overrides
    pub remote: Vec<RemoteSettings>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Local backend connection
    pub local: LocalBackendConfig,

    /// Router timeouts and preference
    pub router: RouterConfig,

    /// Circuit breaker thresholds
    pub circuit: CircuitConfig,

    /// Cache settings
    pub cache: CacheConfig,

    /// Default batch parallelism
    pub parallelism: usize,

    /// Webhook delivery settings
    pub webhooks: WebhookConfig,

    /// Directory for persisted records (in-memory when `None`)
    pub store_dir: Option<PathBuf>,

    /// Per-remote overrides
    pub remotes: Vec<RemoteSettings>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            local: LocalBackendConfig::default(),
            router: RouterConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            parallelism: DEFAULT_PARALLELISM,
            webhooks: WebhookConfig::default(),
            store_dir: None,
            remotes: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DispatchConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the last applied value came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values that would disable a component silently
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.local.port == 0 {
            return invalid("local.port must be non-zero");
        }
        if self.local.timeout.is_zero() || self.router.remote_timeout.is_zero() {
            return invalid("timeouts must be non-zero");
        }
        if self.circuit.failure_threshold == 0 {
            return invalid("circuit.failure_threshold must be at least 1");
        }
        if self.cache.enabled && self.cache.ttl.is_zero() {
            return invalid("cache.ttl_secs must be non-zero when caching is enabled");
        }
        if self.parallelism == 0 {
            return invalid("batch.parallelism must be at least 1");
        }
        if self.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::ValidationError(format!(
                "batch.parallelism must be at most {MAX_PARALLELISM}"
            )));
        }
        if self.webhooks.max_attempts == 0 {
            return invalid("webhooks.max_attempts must be at least 1");
        }
        if let Some(remote) = self
            .remotes
            .iter()
            .find(|r| r.price_per_1k.is_some_and(|p| p < 0.0 || !p.is_finite()))
        {
            return Err(ConfigError::ValidationError(format!(
                "remote '{}' has an invalid price",
                remote.id
            )));
        }
        Ok(())
    }

    /// Catalog with config overrides applied
    ///
    /// Remotes are enabled when their API key variable is set, then the
    /// `[[remote]]` tables are applied on top.
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        let mut catalog = Catalog::builtin();
        catalog.enable_from_env();
        catalog.apply_settings(&self.remotes);
        catalog.set_enabled(LOCAL_BACKEND, self.local.enabled);
        catalog
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ai-dispatch/dispatch.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ai-dispatch").join("dispatch.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<DispatchConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DispatchConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration using `env` to look up environment variables
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<DispatchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DispatchConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: DispatchToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);

    Ok(config)
}

fn apply_toml_config(config: &mut DispatchConfig, toml: DispatchToml) {
    // Local backend
    if let Some(host) = toml.local.host {
        config.local.host = host;
    }
    if let Some(port) = toml.local.port {
        config.local.port = port;
    }
    if let Some(secs) = toml.local.refresh_interval_secs {
        config.local.refresh_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.local.timeout_secs {
        config.local.timeout = Duration::from_secs(secs);
    }
    if let Some(enabled) = toml.local.enabled {
        config.local.enabled = enabled;
    }

    // Routing
    if toml.routing.preferred_backend.is_some() {
        config.router.preferred_backend = toml.routing.preferred_backend;
    }
    if let Some(secs) = toml.routing.remote_timeout_secs {
        config.router.remote_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.routing.rate_limit_cooldown_secs {
        config.router.rate_limit_cooldown = Duration::from_secs(secs);
    }
    config.router.local_timeout = config.local.timeout;

    // Circuit breaker
    if let Some(threshold) = toml.circuit.failure_threshold {
        config.circuit.failure_threshold = threshold;
    }
    if let Some(secs) = toml.circuit.cooldown_secs {
        config.circuit.cooldown = Duration::from_secs(secs);
    }

    // Cache
    if let Some(secs) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(secs);
    }
    if let Some(enabled) = toml.cache.enabled {
        config.cache.enabled = enabled;
    }

    // Batch
    if let Some(parallelism) = toml.batch.parallelism {
        config.parallelism = parallelism;
    }

    // Webhooks
    if let Some(attempts) = toml.webhooks.max_attempts {
        config.webhooks.max_attempts = attempts;
    }
    if let Some(ms) = toml.webhooks.base_delay_ms {
        config.webhooks.base_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.webhooks.timeout_secs {
        config.webhooks.timeout = Duration::from_secs(secs);
    }

    if toml.store.dir.is_some() {
        config.store_dir = toml.store.dir;
    }
    config.remotes = toml.remote;
}

fn apply_env_config<F>(config: &mut DispatchConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

    // Local backend
    if let Some(host) = env("OLLAMA_HOST") {
        config.local.host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = env("OLLAMA_PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
        config.local.port = port;
        config.source = ConfigSource::Env;
    }

    // Routing
    if let Some(backend) = env("DISPATCH_PREFERRED_BACKEND") {
        config.router.preferred_backend = Some(backend).filter(|b| !b.is_empty());
        config.source = ConfigSource::Env;
    }

    // Circuit breaker
    if let Some(threshold) = parsed("DISPATCH_CIRCUIT_THRESHOLD") {
        config.circuit.failure_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed("DISPATCH_CIRCUIT_COOLDOWN") {
        config.circuit.cooldown = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Cache
    if let Some(secs) = parsed("DISPATCH_CACHE_TTL") {
        config.cache.ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    // Batch
    if let Some(parallelism) = parsed("DISPATCH_PARALLELISM") {
        config.parallelism = usize::try_from(parallelism).unwrap_or(usize::MAX);
        config.source = ConfigSource::Env;
    }

    // Webhooks
    if let Some(attempts) = parsed("DISPATCH_WEBHOOK_ATTEMPTS") {
        config.webhooks.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        config.source = ConfigSource::Env;
    }

    if let Some(dir) = env("DISPATCH_STORE_DIR") {
        config.store_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Ollama host override
    pub host: Option<String>,

    /// Ollama port override
    pub port: Option<u16>,

    /// Preferred backend override
    pub preferred_backend: Option<String>,

    /// Batch parallelism override
    pub parallelism: Option<usize>,

    /// Store directory override
    pub store_dir: Option<PathBuf>,

    /// Disable the result cache
    pub no_cache: bool,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host override
    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Set port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set preferred backend override
    #[must_use]
    pub fn with_preferred_backend(mut self, backend: String) -> Self {
        self.preferred_backend = Some(backend);
        self
    }

    /// Set parallelism override
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Set store directory override
    #[must_use]
    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = Some(dir);
        self
    }

    /// Disable caching
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut DispatchConfig) {
        if self.host.is_some()
            || self.port.is_some()
            || self.preferred_backend.is_some()
            || self.parallelism.is_some()
            || self.store_dir.is_some()
            || self.no_cache
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref host) = self.host {
            config.local.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.local.port = port;
        }
        if let Some(ref backend) = self.preferred_backend {
            config.router.preferred_backend = Some(backend.clone());
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(ref dir) = self.store_dir {
            config.store_dir = Some(dir.clone());
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
