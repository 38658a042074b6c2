//! # News Rewriter
//!
//! An ingestion pipeline that pulls items from RSS/Atom feeds, isolates the
//! article text of each linked page, rewrites it into a new article through
//! an OpenAI-compatible text backend, attaches a cover image and persists
//! the result under a unique slug.
//!
//! ## Features
//!
//! - Concurrent feed aggregation with per-feed failure isolation
//! - Heuristic main-text extraction tuned for Indonesian news sites
//! - Style/format/language controlled rewriting and theme-based writing
//! - Optional cover image synthesis and re-hosting of source images
//! - Deterministic HTML normalization of generated bodies
//! - Scheduled jobs addressed by an opaque trigger key
//!
//! ## Usage
//!
//! ```sh
//! news_rewriter --config news.yaml serve --port 3000
//! news_rewriter import https://example.com/berita/1 --source-name Tempo --attribution
//! ```
//!
//! ## Architecture
//!
//! 1. **Aggregation**: fetch feeds concurrently ([`scrapers::feeds`])
//! 2. **Extraction**: isolate article text ([`scrapers::article`])
//! 3. **Rewrite**: generate a new article ([`rewriter`])
//! 4. **Images**: generate or relocate a cover ([`images`])
//! 5. **Normalization**: force block markup ([`normalizer`])
//! 6. **Persistence**: slug, attribution, single insert ([`writer`], [`store`])
//!
//! Jobs ([`jobs`]) run steps 1-6 per item; [`server`] exposes everything
//! over HTTP.

use clap::Parser;
use serde::Serialize;
use serde_json::{Value, json};
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cli;
mod config;
mod error;
mod images;
mod jobs;
mod models;
mod normalizer;
mod pipeline;
mod rewriter;
mod scrapers;
mod server;
mod store;
mod utils;
mod writer;

use cli::{Cli, Command, JobAction};
use config::Config;
use error::PipelineError;
use jobs::{JobRunner, NewJob};
use pipeline::{ImportRequest, Pipeline, ThemeRequest};
use store::{SnapshotStore, Store};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args.config, "Parsed CLI arguments");

    let mut config = Config::load(args.config.as_deref())?;
    config.apply_overrides(&args);

    let store: Arc<dyn Store> = match &config.store.path {
        Some(path) => Arc::new(SnapshotStore::open(path, &config.default_category.0).await?),
        None => {
            warn!("No store path configured; articles and jobs live in memory only");
            Arc::new(SnapshotStore::in_memory(&config.default_category.0))
        }
    };
    let pipeline = Arc::new(Pipeline::from_config(&config, store)?);
    let jobs = Arc::new(JobRunner::new(pipeline.clone()));

    if let Command::Serve { host, port } = &args.command {
        let state = server::AppState {
            pipeline,
            jobs,
            site_url: config.site_url.0.clone(),
        };
        return server::serve(state, host, *port).await;
    }

    let outcome = dispatch(args.command, &config, &pipeline, &jobs).await;
    let elapsed = start_time.elapsed();
    match outcome {
        Ok(data) => {
            print_envelope(&json!({ "success": true, "data": data }))?;
            info!(?elapsed, "Execution complete");
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, ?elapsed, "Command failed");
            print_envelope(&json!({ "success": false, "error": e.to_string(), "kind": e.kind() }))?;
            Err(e.into())
        }
    }
}

/// Run one non-server command and return its envelope payload.
async fn dispatch(
    command: Command,
    config: &Config,
    pipeline: &Pipeline,
    jobs: &JobRunner,
) -> Result<Value, PipelineError> {
    match command {
        Command::Serve { .. } => Ok(Value::Null),

        Command::Feeds { feeds, url } => match url {
            Some(url) => to_value(pipeline.feeds().fetch_custom(&url).await?),
            None => {
                let aggregation = pipeline.feeds().aggregate(&feeds).await;
                info!(
                    items = aggregation.items.len(),
                    failed = aggregation.failures.len(),
                    "Feeds fetched"
                );
                to_value(aggregation)
            }
        },

        Command::Extract { url } => to_value(pipeline.extractor().extract(&url).await?),

        Command::Import {
            url,
            source_name,
            options,
            attribution,
        } => {
            let request = ImportRequest {
                source_name,
                options: options.writing_options(),
                category: options.category,
                generate_image: options.image,
                publish: options.publish,
                attribution,
                ..ImportRequest::new(url)
            };
            to_value(pipeline.import(request).await?)
        }

        Command::Generate { theme, options } => {
            let request = ThemeRequest {
                theme,
                variation: None,
                options: options.writing_options(),
                category: options.category,
                generate_image: options.image,
                publish: options.publish,
            };
            to_value(pipeline.generate(request).await?)
        }

        Command::Jobs { action } => match action {
            JobAction::Add {
                name,
                theme,
                feeds,
                feed_url,
                articles_per_run,
                attribution,
                options,
            } => {
                let job = jobs
                    .create(NewJob {
                        name,
                        theme,
                        feed_ids: feeds,
                        feed_url,
                        category_id: options.category,
                        style: options.style,
                        model_type: options.model,
                        target_language: options.language,
                        generate_image: options.image,
                        is_published: options.publish,
                        show_source_attribution: attribution,
                        articles_per_run,
                    })
                    .await?;
                let trigger_url = config.trigger_url(&job.trigger_key);
                info!(%trigger_url, "Job created");
                Ok(json!({ "job": job, "triggerUrl": trigger_url }))
            }
            JobAction::List => {
                let listed: Vec<Value> = jobs
                    .list()
                    .await?
                    .into_iter()
                    .map(|job| {
                        let trigger_url = config.trigger_url(&job.trigger_key);
                        json!({ "job": job, "triggerUrl": trigger_url })
                    })
                    .collect();
                Ok(Value::Array(listed))
            }
            JobAction::Enable { id } => to_value(jobs.set_active(&id, true).await?),
            JobAction::Disable { id } => to_value(jobs.set_active(&id, false).await?),
        },

        Command::Trigger { key } => to_value(jobs.trigger(&key).await?),
    }
}

fn to_value<T: Serialize>(data: T) -> Result<Value, PipelineError> {
    serde_json::to_value(data).map_err(|e| PipelineError::Storage(format!("serializing output: {e}")))
}

fn print_envelope(envelope: &Value) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}
