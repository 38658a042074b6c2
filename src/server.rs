//! HTTP invocation surface.
//!
//! Every response uses one envelope: `{"success": true, "data": ...}` or
//! `{"success": false, "error": "...", "kind": "..."}` with the status code
//! of the failure category.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::jobs::{JobRunner, NewJob};
use crate::models::{AutoJob, Language, NewsModel, NewsStyle};
use crate::normalizer::normalize;
use crate::pipeline::{FALLBACK_SOURCE_NAME, ImportRequest, Pipeline, ThemeRequest};
use crate::rewriter::WritingOptions;

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub jobs: Arc<JobRunner>,
    /// Public base URL used to build trigger URLs.
    pub site_url: String,
}

impl AppState {
    fn trigger_url(&self, key: &str) -> String {
        format!("{}/api/cron/{key}", self.site_url.trim_end_matches('/'))
    }

    fn job_view(&self, job: AutoJob) -> JobView {
        JobView {
            trigger_url: self.trigger_url(&job.trigger_key),
            job,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/feeds", get(list_feed_items))
        .route("/api/feeds/catalog", get(feed_catalog))
        .route("/api/feeds/custom", get(custom_feed))
        .route("/api/extract", post(extract))
        .route("/api/rewrite", post(rewrite))
        .route("/api/articles", get(list_articles))
        .route("/api/articles/import", post(import_article))
        .route("/api/generate", post(generate))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", patch(update_job))
        .route("/api/cron/:trigger_key", get(run_job))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<(), Box<dyn Error>> {
    let app = create_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, "Serving invocation API");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn success<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}

/// Turn a body rejection into the envelope instead of axum's plain text.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, PipelineError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| PipelineError::Validation(e.body_text()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    #[serde(flatten)]
    job: AutoJob,
    trigger_url: String,
}

#[derive(Debug, Deserialize)]
struct FeedsQuery {
    /// Comma-separated catalog ids; empty means all.
    feeds: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomFeedQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractBody {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WritingBody {
    style: NewsStyle,
    model: NewsModel,
    language: Language,
}

impl From<&WritingBody> for WritingOptions {
    fn from(body: &WritingBody) -> Self {
        WritingOptions {
            style: body.style,
            model: body.model,
            language: body.language,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteBody {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    source_name: Option<String>,
    #[serde(flatten)]
    writing: WritingBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody {
    url: String,
    title: Option<String>,
    source_name: Option<String>,
    image_url: Option<String>,
    category_id: Option<String>,
    #[serde(default)]
    generate_image: bool,
    #[serde(default)]
    is_published: bool,
    #[serde(default)]
    show_source_attribution: bool,
    #[serde(flatten)]
    writing: WritingBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    #[serde(default)]
    theme: String,
    category: Option<String>,
    #[serde(default)]
    generate_image: bool,
    #[serde(default)]
    is_published: bool,
    #[serde(flatten)]
    writing: WritingBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateJobBody {
    is_active: bool,
}

async fn list_feed_items(
    State(state): State<AppState>,
    Query(query): Query<FeedsQuery>,
) -> Response {
    let ids: Vec<String> = query
        .feeds
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let aggregation = state.pipeline.feeds().aggregate(&ids).await;
    success(json!({
        "count": aggregation.items.len(),
        "items": aggregation.items,
        "failures": aggregation.failures,
    }))
}

async fn feed_catalog(State(state): State<AppState>) -> Response {
    success(state.pipeline.feeds().catalog())
}

async fn custom_feed(
    State(state): State<AppState>,
    Query(query): Query<CustomFeedQuery>,
) -> Result<Response, PipelineError> {
    let url = query
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| PipelineError::Validation("query parameter 'url' is required".to_string()))?;
    let feed = state.pipeline.feeds().fetch_custom(url.trim()).await?;
    Ok(success(feed))
}

async fn extract(
    State(state): State<AppState>,
    payload: Result<Json<ExtractBody>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let request = body(payload)?;
    let extracted = state.pipeline.extractor().extract(&request.url).await?;
    Ok(success(extracted))
}

async fn rewrite(
    State(state): State<AppState>,
    payload: Result<Json<RewriteBody>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let request = body(payload)?;
    let source = request.source_name.as_deref().unwrap_or(FALLBACK_SOURCE_NAME);
    let mut article = state
        .pipeline
        .rewriter()
        .rewrite(&request.title, &request.content, source, (&request.writing).into())
        .await?;
    article.content = normalize(&article.content);
    Ok(success(article))
}

async fn list_articles(State(state): State<AppState>) -> Result<Response, PipelineError> {
    let mut articles = state.pipeline.store().list_articles().await?;
    articles.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(success(articles))
}

async fn import_article(
    State(state): State<AppState>,
    payload: Result<Json<ImportBody>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let request = body(payload)?;
    let import = ImportRequest {
        title_hint: request.title,
        source_name: request
            .source_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_SOURCE_NAME.to_string()),
        source_image: request.image_url,
        options: (&request.writing).into(),
        category: request.category_id,
        generate_image: request.generate_image,
        publish: request.is_published,
        attribution: request.show_source_attribution,
        ..ImportRequest::new(request.url)
    };
    let article = state.pipeline.import(import).await?;
    Ok((StatusCode::CREATED, success(article)).into_response())
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let request = body(payload)?;
    let article = state
        .pipeline
        .generate(ThemeRequest {
            theme: request.theme,
            variation: None,
            options: (&request.writing).into(),
            category: request.category,
            generate_image: request.generate_image,
            publish: request.is_published,
        })
        .await?;
    Ok((StatusCode::CREATED, success(article)).into_response())
}

async fn list_jobs(State(state): State<AppState>) -> Result<Response, PipelineError> {
    let mut jobs = state.jobs.list().await?;
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let views: Vec<JobView> = jobs.into_iter().map(|j| state.job_view(j)).collect();
    Ok(success(views))
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<NewJob>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let job = state.jobs.create(body(payload)?).await?;
    Ok((StatusCode::CREATED, success(state.job_view(job))).into_response())
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateJobBody>, JsonRejection>,
) -> Result<Response, PipelineError> {
    let update = body(payload)?;
    let job = state.jobs.set_active(&id, update.is_active).await?;
    Ok(success(state.job_view(job)))
}

async fn run_job(
    State(state): State<AppState>,
    Path(trigger_key): Path<String>,
) -> Result<Response, PipelineError> {
    let report = state.jobs.trigger(&trigger_key).await?;
    Ok(success(report))
}
