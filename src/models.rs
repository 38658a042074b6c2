//! Data models flowing through the ingestion pipeline.
//!
//! Ephemeral stage values:
//! - [`FeedItem`]: one entry pulled from an RSS/Atom feed
//! - [`ExtractedContent`]: main text isolated from an article page
//! - [`RewrittenArticle`]: output of the rewrite engine
//! - [`CoverImage`]: optional image attachment with its provenance
//!
//! Persisted records:
//! - [`Article`]: the final, write-once article
//! - [`AutoJob`]: a recurring ingestion task addressed by a trigger key
//! - [`Category`]: target section for an article
//!
//! JSON field names are camelCase because these values are returned as-is by
//! the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A feed entry normalized across RSS and Atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    /// Headline as published by the feed.
    pub title: String,
    /// Canonical source URL of the article.
    pub link: String,
    /// Display name of the feed the item came from.
    pub source_name: String,
    /// Publication time, when the feed carries a parseable one.
    pub published_at: Option<DateTime<Utc>>,
    /// Whether the entry references an image at all.
    pub has_image_hint: bool,
    /// The referenced image, when it could be located.
    pub image_url: Option<String>,
    /// Description or encoded content carried inline by the feed.
    pub summary: Option<String>,
    /// Author or `dc:creator`.
    pub author: Option<String>,
}

/// Main article text isolated from a third-party page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedContent {
    pub title: String,
    /// Paragraphs joined by blank lines, capped in length.
    pub body_text: String,
    pub source_url: String,
    pub byline: Option<String>,
    /// Lead image of the page, resolved to an absolute URL.
    pub image_url: Option<String>,
}

/// A new article produced by the generative-text backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrittenArticle {
    pub title: String,
    /// Markup or prose; rewritten in place by the normalizer.
    pub content: String,
    pub excerpt: String,
}

/// Where the final article image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageOrigin {
    /// Synthesized by the generative-image backend.
    Generated,
    /// Source image re-hosted on the asset host.
    Uploaded,
    /// Source image kept at its original URL because relocation failed.
    Original,
    None,
}

/// Optional image attachment of an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub url: Option<String>,
    pub origin: ImageOrigin,
}

impl CoverImage {
    pub fn none() -> Self {
        Self {
            url: None,
            origin: ImageOrigin::None,
        }
    }

    pub fn new(url: String, origin: ImageOrigin) -> Self {
        Self {
            url: Some(url),
            origin,
        }
    }
}

/// Writing style requested from the text backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NewsStyle {
    #[default]
    Formal,
    #[serde(alias = "Casual")]
    Santai,
    Investigatif,
    Provokatif,
    Inspiratif,
}

impl NewsStyle {
    /// Tone guidance appended to the prompt.
    pub fn guidance(&self) -> &'static str {
        match self {
            NewsStyle::Formal => "Formal, measured and authoritative, in the register of a national daily.",
            NewsStyle::Santai => "Casual and conversational, easy to read, without slang that obscures facts.",
            NewsStyle::Investigatif => "Investigative: probe causes, responsibilities and open questions.",
            NewsStyle::Provokatif => "Provocative: sharp framing that challenges assumptions, never inventing facts.",
            NewsStyle::Inspiratif => "Inspirational: emphasise human effort, resilience and positive impact.",
        }
    }
}

impl fmt::Display for NewsStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NewsStyle::Formal => "Formal",
            NewsStyle::Santai => "Santai",
            NewsStyle::Investigatif => "Investigatif",
            NewsStyle::Provokatif => "Provokatif",
            NewsStyle::Inspiratif => "Inspiratif",
        };
        f.write_str(s)
    }
}

/// Article format requested from the text backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NewsModel {
    #[default]
    #[serde(rename = "Breaking News")]
    BreakingNews,
    #[serde(rename = "Feature Story")]
    FeatureStory,
    Opinion,
    Interview,
    Editorial,
}

impl NewsModel {
    pub fn guidance(&self) -> &'static str {
        match self {
            NewsModel::BreakingNews => "Inverted pyramid: the most important facts first, short paragraphs.",
            NewsModel::FeatureStory => "Feature: narrative opening, context and colour before the details.",
            NewsModel::Opinion => "Opinion column: a clear thesis argued from the reported facts.",
            NewsModel::Interview => "Interview-led: structure the piece around the voices in the source.",
            NewsModel::Editorial => "Editorial: the outlet's position, reasoned and concise.",
        }
    }
}

impl fmt::Display for NewsModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NewsModel::BreakingNews => "Breaking News",
            NewsModel::FeatureStory => "Feature Story",
            NewsModel::Opinion => "Opinion",
            NewsModel::Interview => "Interview",
            NewsModel::Editorial => "Editorial",
        };
        f.write_str(s)
    }
}

/// Output language of generated articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Id,
    En,
}

impl Language {
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Id => "Bahasa Indonesia",
            Language::En => "English",
        }
    }
}

/// A persisted, write-once article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    /// Globally unique, immutable after creation.
    pub slug: String,
    /// Normalized HTML, with the source attribution block appended when requested.
    pub content: String,
    pub excerpt: String,
    pub featured_image_url: Option<String>,
    pub category_id: String,
    pub author_id: Option<String>,
    pub source_url: Option<String>,
    pub source_name: Option<String>,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// Terminal status of the most recent job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    #[default]
    None,
}

/// A recurring ingestion task.
///
/// Jobs with `feed_ids` or `feed_url` set pull items from feeds and rewrite
/// them; otherwise they write fresh articles from `theme`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoJob {
    pub id: String,
    pub name: String,
    /// Opaque, unique credential for unattended invocation.
    pub trigger_key: String,
    pub theme: String,
    #[serde(default)]
    pub feed_ids: Vec<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    pub category_id: Option<String>,
    pub style: NewsStyle,
    pub model_type: NewsModel,
    #[serde(default)]
    pub target_language: Language,
    pub generate_image: bool,
    pub is_published: bool,
    #[serde(default)]
    pub show_source_attribution: bool,
    pub articles_per_run: u32,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: RunStatus,
    pub total_runs: u64,
    pub total_articles_generated: u64,
    /// Feed items passed over because their source was already stored.
    #[serde(default)]
    pub total_duplicates_skipped: u64,
    pub created_at: DateTime<Utc>,
}

impl AutoJob {
    /// Whether the job pulls from feeds rather than writing from its theme.
    pub fn is_feed_sourced(&self) -> bool {
        !self.feed_ids.is_empty() || self.feed_url.is_some()
    }
}

/// Statistics written back to a job once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub at: DateTime<Utc>,
    pub status: RunStatus,
    pub articles: u64,
    /// Items skipped as already imported.
    #[serde(default)]
    pub skipped: u64,
}
