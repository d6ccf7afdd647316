//! dispatchd - Command-Line Host for ai-dispatch
//!
//! Routes prompts through the local Ollama backend with the dispatcher's
//! caching, job records and usage tracking.
//!
//! # Usage
//!
//! ```bash
//! # One completion
//! dispatchd complete "Explain borrowing in two sentences"
//!
//! # A batch, one prompt per line
//! dispatchd batch prompts.txt --parallelism 3
//!
//! # Backend and usage status
//! dispatchd status --json
//!
//! # Installed local models
//! dispatchd models
//!
//! # Verbose logging
//! RUST_LOG=debug dispatchd status
//! ```
//!
//! With `--store-dir` (or `[store] dir` in the config file) cache entries,
//! circuit states, usage counters and job records survive between runs.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dispatch_core::config::{default_config_path, load_config_from_path, ConfigOverrides};
use dispatch_core::context::{RouterContext, StatusReport};
use dispatch_core::routing::CompletionRequest;

/// dispatchd - cost-aware routing across local and remote AI backends
#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "DISPATCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Ollama host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Ollama port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Remote backend tried right after the local one
    #[arg(long, value_name = "BACKEND")]
    prefer: Option<String>,

    /// Directory for persisted state
    #[arg(long, env = "DISPATCH_STORE_DIR", value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Disable the result cache
    #[arg(long)]
    no_cache: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "DISPATCH_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Complete a single prompt
    Complete {
        /// Prompt text
        prompt: String,

        /// Backend to try first
        #[arg(short, long)]
        backend: Option<String>,

        /// Model to request
        #[arg(short, long)]
        model: Option<String>,

        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Task kind, part of the cache key
        #[arg(long)]
        task: Option<String>,
    },

    /// Run every prompt in a file (one per line)
    Batch {
        /// File with one prompt per line; `#` starts a comment line
        file: PathBuf,

        /// Concurrent requests
        #[arg(short, long, env = "DISPATCH_PARALLELISM")]
        parallelism: Option<usize>,

        /// Print the batch summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show backend, usage and circuit status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List installed local models
    Models,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref host) = self.host {
            overrides = overrides.with_host(host.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        if let Some(ref backend) = self.prefer {
            overrides = overrides.with_preferred_backend(backend.clone());
        }
        if let Some(ref dir) = self.store_dir {
            overrides = overrides.with_store_dir(dir.clone());
        }
        if self.no_cache {
            overrides = overrides.without_cache();
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("dispatchd={level},dispatch_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Prompts from a batch file: trimmed, blank and `#` lines skipped
fn parse_batch(content: &str) -> Vec<CompletionRequest> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(CompletionRequest::new)
        .collect()
}

fn render_status(status: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Backends:");
    for backend in &status.backends {
        let price = if backend.is_free {
            "free".to_string()
        } else {
            format!("${:.4}/1k", backend.price_per_1k)
        };
        let _ = writeln!(
            out,
            "  {:<12} {:<13} {:<12} used={:<5} tokens={:<8} cost=${:.4}",
            backend.id, backend.status.label(), price, backend.usage_count, backend.tokens_used, backend.total_cost
        );
        if let Some(ref err) = backend.last_error {
            let _ = writeln!(out, "  {:<12} last error: {err}", "");
        }
    }

    let usage = &status.usage;
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Requests: {} (free {}, paid {}), {:.0}% free",
        usage.total_requests, usage.free_requests, usage.paid_requests, usage.free_usage_percentage
    );
    let _ = writeln!(
        out,
        "Spent: ${:.4}   Saved: ${:.4}",
        usage.paid_cost, usage.cost_saved
    );
    let _ = writeln!(
        out,
        "Cache: {} entries, {} hits, {} misses",
        status.cache.entries, status.cache.hits, status.cache.misses
    );
    if let Some(ref preferred) = status.preferred_backend {
        let _ = writeln!(out, "Preferred backend: {preferred}");
    }
    let _ = writeln!(out, "{}", usage.recommendation);
    out
}

async fn run(ctx: &RouterContext, command: Command) -> Result<()> {
    match command {
        Command::Complete {
            prompt,
            backend,
            model,
            temperature,
            max_tokens,
            task,
        } => {
            let mut request = CompletionRequest::new(prompt);
            if let Some(backend) = backend {
                request = request.with_backend(backend);
            }
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(t) = temperature {
                request = request.with_temperature(t);
            }
            if let Some(n) = max_tokens {
                request = request.with_max_tokens(n);
            }
            if let Some(task) = task {
                request = request.with_task(task);
            }

            let result = ctx.complete(request).await?;
            println!("{}", result.text);
            eprintln!(
                "[{} / {}{}] tokens={} cost=${:.4}",
                result.backend,
                result.model,
                if result.cached { ", cached" } else { "" },
                result.tokens,
                result.cost
            );
        }

        Command::Batch {
            file,
            parallelism,
            json,
        } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read batch file: {}", file.display()))?;
            let requests = parse_batch(&content);
            info!(count = requests.len(), "Submitting batch");

            let report = ctx.complete_batch(requests, parallelism).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report.summary())?);
            } else {
                for job in &report.jobs {
                    match (&job.result, &job.error) {
                        (Some(text), _) => println!(
                            "{} [{}] {}",
                            job.id,
                            job.backend.as_deref().unwrap_or("-"),
                            text
                        ),
                        (None, Some(err)) => println!("{} FAILED {err}", job.id),
                        (None, None) => println!("{} {}", job.id, job.status),
                    }
                }
                eprintln!(
                    "{}: {} completed, {} failed ({})",
                    report.batch.id, report.batch.completed, report.batch.failed, report.batch.status
                );
            }
        }

        Command::Status { json } => {
            let status = ctx.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_status(&status));
            }
        }

        Command::Models => {
            let status = ctx.status().await;
            match status.local {
                Some(local) if local.available => {
                    for model in &local.models {
                        println!("{}\t{}", model.info.name, model.info.size);
                    }
                }
                Some(local) => {
                    anyhow::bail!(
                        "Ollama is not reachable at {}: {}",
                        ctx.config().local.base_url(),
                        local.last_error.unwrap_or_else(|| "no response".to_string())
                    );
                }
                None => anyhow::bail!("No local backend attached"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!(source = %config.source(), "Configuration resolved");

    let persistent = config.store_dir.is_some();
    let ctx = RouterContext::builder(config).with_ollama().build();

    if persistent {
        if let Err(e) = ctx.restore_state().await {
            warn!(error = %e, "Failed to restore saved state, starting fresh");
        }
    }

    let outcome = run(&ctx, args.command).await;

    if persistent {
        if let Err(e) = ctx.persist_state().await {
            warn!(error = %e, "Failed to persist state");
        }
    }

    outcome
}
