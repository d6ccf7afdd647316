//! Dispatch Core - Cost-Aware Request Routing for ai-dispatch
//!
//! This crate routes text-completion requests across one free local backend
//! (Ollama) and several paid remote backends. It prefers the free backend,
//! falls back on failure, isolates failing remotes behind circuit breakers,
//! caches results and tracks what was spent and saved.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         RouterContext                            │
//! │   complete()   complete_batch()   status()   register_webhook()  │
//! └────────┬──────────────────┬──────────────────────────┬───────────┘
//!          │                  │                          │
//!          │          ┌───────┴────────┐          ┌──────┴──────┐
//!          │          │ BatchScheduler │─────────▶│  Notifier   │
//!          │          │ (Semaphore(P)) │  events  │ (HMAC, retry)│
//!          │          └───────┬────────┘          └─────────────┘
//!          ▼                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Router                               │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐ ┌──────────────────┐ │
//! │  │  Cache   │ │ Catalog  │ │ CircuitTable │ │  ModelRegistry   │ │
//! │  │  (TTL)   │ │(remotes) │ │ (per remote) │ │ (local probe)    │ │
//! │  └──────────┘ └──────────┘ └──────────────┘ └──────────────────┘ │
//! │                        UsageTracker                              │
//! └────────┬──────────────────────────────────────────┬──────────────┘
//!          ▼                                          ▼
//!   TextGenerator (local)                  TextGenerator (remotes)
//!                         KeyValueStore
//!            (jobs, batches, cache, circuits, usage)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use dispatch_core::{config::load_config, CompletionRequest, RouterContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let ctx = RouterContext::builder(config).with_ollama().build();
//!
//!     let result = ctx
//!         .complete(CompletionRequest::new("Summarize RFC 2616").with_max_tokens(200))
//!         .await?;
//!     println!("{} (via {}, ${:.4})", result.text, result.backend, result.cost);
//!
//!     let status = ctx.status().await;
//!     println!("{}", status.usage.recommendation);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: the `TextGenerator` collaborator and the Ollama client
//! - [`routing`]: catalog, model registry, circuit breakers, router, usage
//! - [`cache`]: content-addressed TTL result cache
//! - [`batch`]: bounded-parallelism batch execution
//! - [`jobs`]: job and batch records with their state machines
//! - [`notify`]: signed webhook delivery
//! - [`store`]: pluggable key-value persistence
//! - [`context`]: the assembled [`RouterContext`]
//! - [`config`]: TOML and environment configuration
//! - [`clock`]: injectable time source
//! - [`error`]: error taxonomy

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod routing;
pub mod store;

// Re-exports for convenience
pub use backend::{GenerateOptions, Generation, OllamaBackend, TextGenerator};
pub use batch::{BatchReport, BatchScheduler, BatchSummary};
pub use cache::{CacheConfig, CacheKey, ResultCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_config, ConfigOverrides, DispatchConfig};
pub use context::{RouterContext, StatusReport};
pub use error::{BackendFailure, DispatchError, DispatchResult, StoreError};
pub use jobs::{Batch, BatchId, BatchStatus, Job, JobId, JobStatus};
pub use notify::{Notifier, WebhookAck, WebhookConfig};
pub use routing::{
    Catalog, CircuitConfig, CircuitState, CompletionRequest, CompletionResult, Router,
    RouterConfig, UsageSnapshot, UsageTracker,
};
pub use store::{JsonDirStore, KeyValueStore, MemoryStore};
