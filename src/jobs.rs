//! Job runner: executes an [`AutoJob`] addressed by its trigger key.
//!
//! Per invocation the job moves `Idle -> Running -> Completed(status)` and
//! back to idle. An inactive job is a no-op. Items are processed one after
//! another; one item's failure never stops the rest, except a missing text
//! backend which fails every item the same way. Feed items whose link is
//! already stored are skipped as duplicates. Statistics are written back
//! once, as a single store update, when the run completes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Article, AutoJob, FeedItem, Language, NewsModel, NewsStyle, RunRecord, RunStatus};
use crate::pipeline::{ImportRequest, Pipeline, ThemeRequest};
use crate::rewriter::{THEME_VARIATIONS, WritingOptions};
use crate::store::Store;
use crate::utils::{generate_trigger_key, truncate_chars};

/// Pause between theme articles of one run.
pub const THEME_ITEM_DELAY: Duration = Duration::from_secs(3);

const MAX_ARTICLES_PER_RUN: u32 = 20;

/// Where a job is in its invocation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Running,
    Completed(RunStatus),
}

/// Operator input for a new job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub feed_ids: Vec<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub style: NewsStyle,
    #[serde(default)]
    pub model_type: NewsModel,
    #[serde(default)]
    pub target_language: Language,
    #[serde(default)]
    pub generate_image: bool,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub show_source_attribution: bool,
    #[serde(default = "default_articles_per_run")]
    pub articles_per_run: u32,
}

fn default_articles_per_run() -> u32 {
    1
}

/// Result of one processed item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    /// Source link or theme variation the item was built from.
    pub source: String,
    pub article_id: Option<String>,
    pub slug: Option<String>,
    pub error: Option<String>,
    pub kind: Option<&'static str>,
    /// Already imported by an earlier run; `article_id` is the existing one.
    pub duplicate: bool,
}

impl ItemOutcome {
    fn saved(source: String, article: &Article) -> Self {
        Self {
            source,
            article_id: Some(article.id.clone()),
            slug: Some(article.slug.clone()),
            error: None,
            kind: None,
            duplicate: false,
        }
    }

    fn duplicate(source: String, existing: &Article) -> Self {
        Self {
            duplicate: true,
            ..Self::saved(source, existing)
        }
    }

    fn failed(source: String, e: &PipelineError) -> Self {
        Self {
            source,
            article_id: None,
            slug: None,
            error: Some(e.to_string()),
            kind: Some(e.kind()),
            duplicate: false,
        }
    }
}

/// What a trigger did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RunReport {
    /// The job is inactive; nothing ran and nothing was written.
    #[serde(rename_all = "camelCase")]
    Skipped { job_id: String, job_name: String },
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        job_name: String,
        status: RunStatus,
        articles: u64,
        skipped: u64,
        elapsed_ms: u64,
        items: Vec<ItemOutcome>,
    },
}

/// One invocation in progress.
struct Run {
    job: AutoJob,
    phase: JobPhase,
    started: Instant,
    items: Vec<ItemOutcome>,
}

impl Run {
    fn start(job: AutoJob) -> Self {
        let mut run = Self {
            job,
            phase: JobPhase::Idle,
            started: Instant::now(),
            items: Vec::new(),
        };
        run.enter(JobPhase::Running);
        run
    }

    fn enter(&mut self, next: JobPhase) {
        info!(job = %self.job.name, from = ?self.phase, to = ?next, "Job phase");
        self.phase = next;
    }

    fn saved(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| i.article_id.is_some() && !i.duplicate)
            .count() as u64
    }

    fn skipped(&self) -> u64 {
        self.items.iter().filter(|i| i.duplicate).count() as u64
    }

    /// Close the run and produce the single statistics update. A run that
    /// only met already-imported items succeeded with nothing to do.
    fn complete(&mut self) -> RunRecord {
        let articles = self.saved();
        let skipped = self.skipped();
        let failed = self.items.iter().any(|i| i.error.is_some());
        let status = if articles > 0 || (skipped > 0 && !failed) {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        self.enter(JobPhase::Completed(status));
        RunRecord {
            at: Utc::now(),
            status,
            articles,
            skipped,
        }
    }

    fn report(self, record: RunRecord) -> RunReport {
        RunReport::Completed {
            job_id: self.job.id,
            job_name: self.job.name,
            status: record.status,
            articles: record.articles,
            skipped: record.skipped,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            items: self.items,
        }
    }
}

pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    item_delay: Duration,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            item_delay: THEME_ITEM_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.pipeline.store()
    }

    /// Validate and persist a new job with a fresh trigger key.
    #[instrument(level = "info", skip_all, fields(name = %request.name))]
    pub async fn create(&self, request: NewJob) -> Result<AutoJob, PipelineError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(PipelineError::Validation("job name is required".to_string()));
        }
        let feed_url = request
            .feed_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        let feed_ids: Vec<String> = request
            .feed_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if feed_url.is_none() && feed_ids.is_empty() && request.theme.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a theme, feed ids or a feed URL is required".to_string(),
            ));
        }
        if let Some(unknown) = feed_ids
            .iter()
            .find(|id| !self.pipeline.feeds().catalog().iter().any(|f| &f.id == *id))
        {
            return Err(PipelineError::Validation(format!("unknown feed id '{unknown}'")));
        }
        if !(1..=MAX_ARTICLES_PER_RUN).contains(&request.articles_per_run) {
            return Err(PipelineError::Validation(format!(
                "articles per run must be between 1 and {MAX_ARTICLES_PER_RUN}"
            )));
        }

        let job = AutoJob {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            trigger_key: generate_trigger_key(),
            theme: request.theme.trim().to_string(),
            feed_ids,
            feed_url,
            category_id: request.category_id.filter(|c| !c.trim().is_empty()),
            style: request.style,
            model_type: request.model_type,
            target_language: request.target_language,
            generate_image: request.generate_image,
            is_published: request.is_published,
            show_source_attribution: request.show_source_attribution,
            articles_per_run: request.articles_per_run,
            is_active: true,
            last_run_at: None,
            last_run_status: RunStatus::None,
            total_runs: 0,
            total_articles_generated: 0,
            total_duplicates_skipped: 0,
            created_at: Utc::now(),
        };
        let job = self.store().create_job(job).await?;
        info!(id = %job.id, "Created job");
        Ok(job)
    }

    pub async fn list(&self) -> Result<Vec<AutoJob>, PipelineError> {
        Ok(self.store().list_jobs().await?)
    }

    /// Suspend or resume a job; history is kept either way.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<AutoJob, PipelineError> {
        let job = self.store().set_job_active(id, active).await?;
        info!(id, active, "Job toggled");
        Ok(job)
    }

    /// Run the job behind `trigger_key` to completion.
    #[instrument(level = "info", skip_all, fields(key = %truncate_chars(trigger_key, 4)))]
    pub async fn trigger(&self, trigger_key: &str) -> Result<RunReport, PipelineError> {
        let job = self
            .store()
            .find_job_by_trigger_key(trigger_key)
            .await?
            .ok_or_else(|| PipelineError::NotFound("no job for this trigger key".to_string()))?;

        if !job.is_active {
            info!(job = %job.name, "Job inactive; skipping");
            return Ok(RunReport::Skipped {
                job_id: job.id,
                job_name: job.name,
            });
        }

        let mut run = Run::start(job);
        let fatal = if run.job.is_feed_sourced() {
            self.run_feed_items(&mut run).await
        } else {
            self.run_theme_items(&mut run).await
        };

        let record = run.complete();
        self.store().record_run(&run.job.id, record).await?;
        info!(
            job = %run.job.name,
            status = ?record.status,
            articles = record.articles,
            skipped = record.skipped,
            attempted = run.items.len(),
            "Job run finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(run.report(record)),
        }
    }

    /// Rewrite the first `articles_per_run` items of the job's feeds,
    /// skipping links imported before. Returns the error that stopped the
    /// run early, if any.
    async fn run_feed_items(&self, run: &mut Run) -> Option<PipelineError> {
        let items = match self.feed_items(&run.job).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "Job feed unavailable");
                run.items.push(ItemOutcome::failed(feed_label(&run.job), &e));
                return None;
            }
        };

        for item in items.iter().take(run.job.articles_per_run as usize) {
            match self.store().find_article_by_source_url(&item.link).await {
                Ok(Some(existing)) => {
                    info!(link = %item.link, slug = %existing.slug, "Already imported; skipping");
                    run.items.push(ItemOutcome::duplicate(item.link.clone(), &existing));
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    let e = PipelineError::from(e);
                    warn!(link = %item.link, error = %e, "Duplicate check failed");
                    run.items.push(ItemOutcome::failed(item.link.clone(), &e));
                    continue;
                }
            }
            let request = ImportRequest {
                options: writing_options(&run.job),
                category: run.job.category_id.clone(),
                generate_image: run.job.generate_image,
                publish: run.job.is_published,
                attribution: run.job.show_source_attribution,
                ..ImportRequest::from_item(item)
            };
            match self.pipeline.import(request).await {
                Ok(article) => run.items.push(ItemOutcome::saved(item.link.clone(), &article)),
                Err(e) => {
                    warn!(link = %item.link, kind = e.kind(), error = %e, "Item failed");
                    run.items.push(ItemOutcome::failed(item.link.clone(), &e));
                    if e.is_fatal() {
                        return Some(e);
                    }
                }
            }
        }
        None
    }

    async fn feed_items(&self, job: &AutoJob) -> Result<Vec<FeedItem>, PipelineError> {
        if let Some(url) = job.feed_url.as_deref() {
            return Ok(self.pipeline.feeds().fetch_custom(url).await?.items);
        }
        let aggregation = self.pipeline.feeds().aggregate(&job.feed_ids).await;
        for failure in &aggregation.failures {
            warn!(feed = %failure.feed_id, error = %failure.error, "Job feed failed");
        }
        match aggregation.failures.into_iter().next() {
            Some(failure) if aggregation.items.is_empty() => Err(failure.cause.into()),
            _ => Ok(aggregation.items),
        }
    }

    /// Write `articles_per_run` theme articles, each from its own angle
    /// when more than one is requested.
    async fn run_theme_items(&self, run: &mut Run) -> Option<PipelineError> {
        let count = run.job.articles_per_run as usize;
        for i in 0..count {
            let variation = (count > 1).then(|| THEME_VARIATIONS[i % THEME_VARIATIONS.len()]);
            let request = ThemeRequest {
                theme: run.job.theme.clone(),
                variation: variation.map(str::to_string),
                options: writing_options(&run.job),
                category: run.job.category_id.clone(),
                generate_image: run.job.generate_image,
                publish: run.job.is_published,
            };
            let label = match variation {
                Some(v) => format!("{} ({v})", run.job.theme),
                None => run.job.theme.clone(),
            };
            match self.pipeline.generate(request).await {
                Ok(article) => run.items.push(ItemOutcome::saved(label, &article)),
                Err(e) => {
                    warn!(item = i + 1, kind = e.kind(), error = %e, "Theme article failed");
                    run.items.push(ItemOutcome::failed(label, &e));
                    if e.is_fatal() {
                        return Some(e);
                    }
                }
            }
            if i + 1 < count && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
        }
        None
    }
}

fn writing_options(job: &AutoJob) -> WritingOptions {
    WritingOptions {
        style: job.style,
        model: job.model_type,
        language: job.target_language,
    }
}

fn feed_label(job: &AutoJob) -> String {
    job.feed_url
        .clone()
        .unwrap_or_else(|| job.feed_ids.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedSource;
    use crate::error::BackendError;
    use crate::pipeline::tests::{TAGGED, page, pipeline};
    use crate::rewriter::tests::ScriptedBackend;
    use crate::store::SnapshotStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_job() -> NewJob {
        NewJob {
            name: "Tempo pagi".into(),
            theme: String::new(),
            feed_ids: vec!["mock".into()],
            feed_url: None,
            category_id: None,
            style: NewsStyle::Formal,
            model_type: NewsModel::BreakingNews,
            target_language: Language::Id,
            generate_image: false,
            is_published: true,
            show_source_attribution: true,
            articles_per_run: 3,
        }
    }

    async fn mock_feed(server: &MockServer, items: usize) -> FeedSource {
        let body: String = (1..=items)
            .map(|i| {
                format!(
                    "<item><title>Berita {i}</title><link>{}/berita/{i}</link></item>",
                    server.uri()
                )
            })
            .collect();
        let xml = format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Mock</title>{body}</channel></rss>"#
        );
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(xml))
            .mount(server)
            .await;
        for i in 1..=items {
            Mock::given(method("GET"))
                .and(path(format!("/berita/{i}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(page(&format!("Asli {i}"))))
                .mount(server)
                .await;
        }
        FeedSource {
            id: "mock".into(),
            name: "Mock".into(),
            url: format!("{}/rss", server.uri()),
            category: String::new(),
            country: String::new(),
        }
    }

    #[tokio::test]
    async fn test_partial_batch_counts_only_saved_articles() {
        let server = MockServer::start().await;
        let feed = mock_feed(&server, 3).await;
        let backend = ScriptedBackend::new(vec![
            Ok(TAGGED.to_string()),
            Err(BackendError::Rejected("HTTP 500".into())),
            Ok(TAGGED.to_string()),
        ]);
        let store = Arc::new(SnapshotStore::in_memory("Umum"));
        let runner = JobRunner::new(Arc::new(pipeline(Some(backend.clone()), vec![feed], store.clone())));

        let job = runner.create(feed_job()).await.unwrap();
        let report = runner.trigger(&job.trigger_key).await.unwrap();

        let RunReport::Completed { status, articles, items, .. } = report else {
            panic!("job should have run");
        };
        assert_eq!(status, RunStatus::Success);
        assert_eq!(articles, 2);
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].kind, Some("upstream_rejected"));
        assert!(items[1].source.ends_with("/berita/2"));

        let after = store.find_job_by_trigger_key(&job.trigger_key).await.unwrap().unwrap();
        assert_eq!(after.total_runs, 1);
        assert_eq!(after.total_articles_generated, 2);
        assert_eq!(after.last_run_status, RunStatus::Success);
        assert!(after.last_run_at.is_some());

        let articles = store.list_articles().await.unwrap();
        assert_eq!(articles.len(), 2);
        assert!(articles.iter().all(|a| a.is_published));
        assert!(articles.iter().all(|a| a.content.contains("<strong>Sumber:</strong>")));
        assert!(articles.iter().all(|a| a.content.contains(">Mock</a>")));
        // items 1 and 3 were rewritten; item 2 never reached persistence
        assert_eq!(backend.requests.lock().unwrap().len(), 3);
        assert!(articles.iter().all(|a| !a.source_url.as_deref().unwrap_or("").ends_with("/berita/2")));
    }

    #[tokio::test]
    async fn test_second_run_skips_already_imported_items() {
        let server = MockServer::start().await;
        let feed = mock_feed(&server, 2).await;
        let backend = ScriptedBackend::new(vec![Ok(TAGGED.to_string()), Ok(TAGGED.to_string())]);
        let store = Arc::new(SnapshotStore::in_memory("Umum"));
        let runner = JobRunner::new(Arc::new(pipeline(Some(backend.clone()), vec![feed], store.clone())));
        let job = runner
            .create(NewJob {
                articles_per_run: 2,
                ..feed_job()
            })
            .await
            .unwrap();

        runner.trigger(&job.trigger_key).await.unwrap();
        let report = runner.trigger(&job.trigger_key).await.unwrap();

        let RunReport::Completed { status, articles, skipped, items, .. } = report else {
            panic!("job should have run");
        };
        assert_eq!(status, RunStatus::Success);
        assert_eq!(articles, 0);
        assert_eq!(skipped, 2);
        assert!(items.iter().all(|i| i.duplicate && i.article_id.is_some()));
        assert_eq!(store.list_articles().await.unwrap().len(), 2);
        // no rewrite was requested for the second run
        assert_eq!(backend.requests.lock().unwrap().len(), 2);

        let after = store.find_job_by_trigger_key(&job.trigger_key).await.unwrap().unwrap();
        assert_eq!(after.total_runs, 2);
        assert_eq!(after.total_articles_generated, 2);
        assert_eq!(after.total_duplicates_skipped, 2);
    }

    #[tokio::test]
    async fn test_inactive_job_is_a_no_op() {
        let backend = ScriptedBackend::new(vec![]);
        let store = Arc::new(SnapshotStore::in_memory("Umum"));
        let runner = JobRunner::new(Arc::new(pipeline(Some(backend.clone()), vec![], store.clone())));

        let job = runner
            .create(NewJob {
                theme: "Banjir".into(),
                feed_ids: vec![],
                ..feed_job()
            })
            .await
            .unwrap();
        runner.set_active(&job.id, false).await.unwrap();

        let report = runner.trigger(&job.trigger_key).await.unwrap();
        assert!(matches!(report, RunReport::Skipped { .. }));
        let after = store.find_job_by_trigger_key(&job.trigger_key).await.unwrap().unwrap();
        assert_eq!(after.total_runs, 0);
        assert_eq!(after.last_run_at, None);
        assert_eq!(after.last_run_status, RunStatus::None);
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_trigger_key_is_not_found() {
        let runner = JobRunner::new(Arc::new(pipeline(
            None,
            vec![],
            Arc::new(SnapshotStore::in_memory("Umum")),
        )));
        assert!(matches!(
            runner.trigger("missing").await.unwrap_err(),
            PipelineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_theme_job_uses_variations_and_records_failure() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Unavailable("timeout".into())),
            Err(BackendError::Unavailable("timeout".into())),
        ]);
        let store = Arc::new(SnapshotStore::in_memory("Umum"));
        let runner = JobRunner::new(Arc::new(pipeline(Some(backend.clone()), vec![], store.clone())))
            .with_item_delay(Duration::ZERO);

        let job = runner
            .create(NewJob {
                theme: "Harga pangan".into(),
                feed_ids: vec![],
                articles_per_run: 2,
                ..feed_job()
            })
            .await
            .unwrap();
        let report = runner.trigger(&job.trigger_key).await.unwrap();
        let RunReport::Completed { status, articles, .. } = report else {
            panic!("job should have run");
        };
        assert_eq!(status, RunStatus::Failure);
        assert_eq!(articles, 0);

        let sent = backend.requests.lock().unwrap();
        assert!(sent[0].user.contains("Harga pangan (fokus pada aspek sosial)"));
        assert!(sent[1].user.contains("Harga pangan (fokus pada dampak ekonomi)"));

        let after = store.find_job_by_trigger_key(&job.trigger_key).await.unwrap().unwrap();
        assert_eq!(after.total_runs, 1);
        assert_eq!(after.last_run_status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_missing_text_backend_aborts_and_records_failure() {
        let store = Arc::new(SnapshotStore::in_memory("Umum"));
        let runner = JobRunner::new(Arc::new(pipeline(None, vec![], store.clone())))
            .with_item_delay(Duration::ZERO);
        let job = runner
            .create(NewJob {
                theme: "Pemilu".into(),
                feed_ids: vec![],
                articles_per_run: 3,
                ..feed_job()
            })
            .await
            .unwrap();

        let err = runner.trigger(&job.trigger_key).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        let after = store.find_job_by_trigger_key(&job.trigger_key).await.unwrap().unwrap();
        assert_eq!(after.total_runs, 1);
        assert_eq!(after.last_run_status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let runner = JobRunner::new(Arc::new(pipeline(
            None,
            vec![],
            Arc::new(SnapshotStore::in_memory("Umum")),
        )));
        let unnamed = runner
            .create(NewJob {
                name: " ".into(),
                ..feed_job()
            })
            .await;
        assert!(matches!(unnamed.unwrap_err(), PipelineError::Validation(_)));

        // "mock" is not in this runner's catalog
        let unknown_feed = runner.create(feed_job()).await;
        assert!(unknown_feed.unwrap_err().to_string().contains("unknown feed id"));

        let too_many = runner
            .create(NewJob {
                theme: "x".into(),
                feed_ids: vec![],
                articles_per_run: 0,
                ..feed_job()
            })
            .await;
        assert!(matches!(too_many.unwrap_err(), PipelineError::Validation(_)));

        let job: NewJob = serde_json::from_str(r#"{"name": "Teknologi", "theme": "AI"}"#).unwrap();
        let created = runner.create(job).await.unwrap();
        assert_eq!(created.trigger_key.len(), 16);
        assert_eq!(created.articles_per_run, 1);
        assert!(created.is_active);
        assert!(!created.is_feed_sourced());
    }
}
