//! Backend Integration
//!
//! Backends are reached through the [`TextGenerator`] trait. The crate ships
//! the local Ollama backend; remote providers are plugged in by the host as
//! their own `TextGenerator` implementations.
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_core::backend::{GenerateOptions, OllamaBackend, TextGenerator};
//!
//! let backend = OllamaBackend::from_env();
//! let out = backend.generate("Hello!", "llama3.2", &GenerateOptions::default()).await?;
//! ```

mod ollama;
mod traits;

pub(crate) use ollama::http_client;
pub use ollama::OllamaBackend;
pub use traits::{
    estimate_tokens, BackendKind, GenerateOptions, Generation, LocalBackendConfig, ModelInfo,
    ModelLister, TextGenerator,
};
