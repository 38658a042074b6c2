//! Persistence & dedup writer.
//!
//! Slugs are made unique by construction (title token plus a strictly
//! increasing millisecond suffix), so no existence check precedes the
//! insert. The store still rejects a duplicate slug as a conflict.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Article, CoverImage, RewrittenArticle};
use crate::store::Store;
use crate::utils::{escape_html, slugify_title, truncate_chars};

const SLUG_BASE_CHARS: usize = 100;
const SLUG_FALLBACK: &str = "artikel";

static LAST_SLUG_SUFFIX: AtomicI64 = AtomicI64::new(0);

/// Where a rewritten article came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub url: Option<String>,
    pub name: String,
}

/// Everything needed to commit one article.
#[derive(Debug, Clone)]
pub struct ArticleDraft {
    /// Already normalized.
    pub article: RewrittenArticle,
    pub cover: CoverImage,
    /// Category id or name; `None` picks the store's fallback.
    pub category: Option<String>,
    pub author_id: Option<String>,
    pub source: Option<SourceRef>,
    pub show_attribution: bool,
    pub is_published: bool,
}

pub struct ArticleWriter {
    store: Arc<dyn Store>,
    default_category: String,
}

impl ArticleWriter {
    pub fn new(store: Arc<dyn Store>, default_category: impl Into<String>) -> Self {
        Self {
            store,
            default_category: default_category.into(),
        }
    }

    /// Commit `draft` as a new article in one insert.
    #[instrument(level = "info", skip_all, fields(title = %truncate_chars(&draft.article.title, 60)))]
    pub async fn write(&self, draft: ArticleDraft) -> Result<Article, PipelineError> {
        let title = draft.article.title.trim();
        if title.is_empty() {
            return Err(PipelineError::Validation("article title is empty".to_string()));
        }
        if draft.article.content.trim().is_empty() {
            return Err(PipelineError::Validation("article content is empty".to_string()));
        }

        let category_id = self.resolve_category(draft.category.as_deref()).await?;

        let mut content = draft.article.content.clone();
        if draft.show_attribution {
            if let Some(source) = &draft.source {
                content.push('\n');
                content.push_str(&attribution_block(&source.name, source.url.as_deref()));
            }
        }

        let now = Utc::now();
        let article = Article {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            slug: unique_slug(title),
            content,
            excerpt: draft.article.excerpt.trim().to_string(),
            featured_image_url: draft.cover.url,
            category_id,
            author_id: draft.author_id,
            source_url: draft.source.as_ref().and_then(|s| s.url.clone()),
            source_name: draft.source.map(|s| s.name),
            is_published: draft.is_published,
            created_at: now,
            updated_at: now,
        };

        let saved = self.store.insert_article(article).await?;
        info!(
            id = %saved.id,
            slug = %saved.slug,
            published = saved.is_published,
            image_origin = ?draft.cover.origin,
            "Article saved"
        );
        Ok(saved)
    }

    /// Named category when given (created if unknown), otherwise any
    /// existing one, otherwise the configured default. An unknown id is an
    /// error, never a new category.
    async fn resolve_category(&self, requested: Option<&str>) -> Result<String, PipelineError> {
        if let Some(key) = requested.map(str::trim).filter(|k| !k.is_empty()) {
            if let Some(found) = self.store.find_category(key).await? {
                return Ok(found.id);
            }
            if is_category_id(key) {
                return Err(PipelineError::Validation(format!("unknown category id '{key}'")));
            }
            warn!(category = key, "Unknown category; creating it");
            return Ok(self.store.ensure_category(key).await?.id);
        }
        match self.store.any_category().await? {
            Some(category) => Ok(category.id),
            None => Ok(self.store.ensure_category(&self.default_category).await?.id),
        }
    }
}

/// Category ids are UUIDs; anything else is a category name.
pub fn is_category_id(key: &str) -> bool {
    Uuid::parse_str(key).is_ok()
}

/// URL-safe slug: transliterated title token plus a millisecond suffix that
/// is strictly increasing within the process.
pub fn unique_slug(title: &str) -> String {
    let slug = slugify_title(title);
    let base = truncate_chars(&slug, SLUG_BASE_CHARS).trim_end_matches('-');
    let base = if base.is_empty() { SLUG_FALLBACK } else { base };
    format!("{base}-{}", next_suffix())
}

fn next_suffix() -> i64 {
    let now = Utc::now().timestamp_millis();
    let previous = LAST_SLUG_SUFFIX
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1)
}

/// Fixed-format source credit appended to article content.
pub fn attribution_block(source_name: &str, source_url: Option<&str>) -> String {
    let name = escape_html(source_name.trim());
    let credit = match source_url.filter(|u| u.starts_with("http")) {
        Some(url) => format!(
            "<a href=\"{}\" target=\"_blank\" rel=\"nofollow noopener\">{name}</a>",
            escape_html(url)
        ),
        None => name,
    };
    format!("<div class=\"source-attribution\"><p><strong>Sumber:</strong> {credit}</p></div>")
}
