//! Rewrite engine: turns source material or a theme into a new article.
//!
//! The backend is treated as opaque. Rewrites are requested in a tagged
//! format (`[TITLE]`, `[EXCERPT]`, `[CONTENT]`); a JSON object with the same
//! three fields is accepted as a fallback. Anything else is a rejection:
//! the engine never passes source text through as if it were a rewrite.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::api::{ChatRequest, TextBackend};
use crate::error::{BackendError, PipelineError};
use crate::models::{Language, NewsModel, NewsStyle, RewrittenArticle};
use crate::utils::{looks_truncated, truncate_chars, truncate_for_log};

static TITLE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\[TITLE\](.*?)\[/TITLE\]").unwrap());
static EXCERPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[EXCERPT\](.*?)\[/EXCERPT\]").unwrap());
static CONTENT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[CONTENT\](.*?)\[/CONTENT\]").unwrap());
static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Sub-angles appended to a theme so repeated runs produce distinct articles.
pub const THEME_VARIATIONS: &[&str] = &[
    "fokus pada aspek sosial",
    "fokus pada dampak ekonomi",
    "fokus pada opini masyarakat",
    "fokus pada perspektif masa depan",
    "aspek kontroversial",
    "aspek human interest",
];

const EXCERPT_CHARS: usize = 160;
const IMAGE_PROMPT_SOURCE_CHARS: usize = 500;

const REFUSAL_MARKERS: &[&str] = &[
    "i can't help",
    "i cannot help",
    "i can't assist",
    "i cannot assist",
    "i'm sorry, but",
    "i am unable to",
    "maaf, saya tidak dapat",
    "saya tidak bisa membantu",
];

/// Editorial parameters shared by rewrites and theme articles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritingOptions {
    pub style: NewsStyle,
    pub model: NewsModel,
    pub language: Language,
}

#[derive(Deserialize)]
struct ArticleJson {
    #[serde(default)]
    title: String,
    #[serde(default)]
    excerpt: String,
    #[serde(default)]
    content: String,
}

pub struct Rewriter {
    backend: Option<Arc<dyn TextBackend>>,
    max_content_chars: usize,
}

impl Rewriter {
    pub fn new(backend: Option<Arc<dyn TextBackend>>, max_content_chars: usize) -> Self {
        Self {
            backend,
            max_content_chars,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// The text backend is mandatory: its absence fails loudly.
    pub fn ensure_configured(&self) -> Result<&Arc<dyn TextBackend>, PipelineError> {
        self.backend.as_ref().ok_or_else(|| {
            PipelineError::Configuration(
                "text backend API key is not set (GROQ_API_KEY or text.api_key)".to_string(),
            )
        })
    }

    /// Produce a new article covering the same facts as the source.
    #[instrument(level = "info", skip_all, fields(source = %source_name, style = %options.style, model = %options.model))]
    pub async fn rewrite(
        &self,
        title: &str,
        content: &str,
        source_name: &str,
        options: WritingOptions,
    ) -> Result<RewrittenArticle, PipelineError> {
        let backend = self.ensure_configured()?;
        if content.trim().is_empty() {
            return Err(PipelineError::Validation(
                "source content is empty".to_string(),
            ));
        }

        let source = truncate_chars(content, self.max_content_chars);
        let request = ChatRequest::new(
            rewrite_system_prompt(options),
            format!(
                "Source: {source_name}\n\nOriginal Title: {title}\n\nOriginal Content:\n{source}\n\n\
                 Rewrite this article following the instructions above. Return ONLY the tagged format."
            ),
        );

        let completion = backend.complete(&request).await?;
        debug!(
            chars = completion.content.len(),
            finish_reason = ?completion.finish_reason,
            "Rewrite response received"
        );
        let article = parse_article(&completion.content)?;
        info!(title = %article.title, "Article rewritten");
        Ok(article)
    }

    /// Write a fresh article from a theme.
    #[instrument(level = "info", skip_all, fields(%theme, ?variation))]
    pub async fn write_from_theme(
        &self,
        theme: &str,
        category: &str,
        variation: Option<&str>,
        options: WritingOptions,
    ) -> Result<RewrittenArticle, PipelineError> {
        let backend = self.ensure_configured()?;
        if theme.trim().is_empty() {
            return Err(PipelineError::Validation("theme is required".to_string()));
        }

        let subject = match variation {
            Some(v) => format!("{theme} ({v})"),
            None => theme.to_string(),
        };
        let language = options.language.display_name();
        let request = ChatRequest::new(
            theme_system_prompt(&subject, category, options),
            format!(
                "Write an in-depth {} article about \"{subject}\" in {language}. \
                 Include at least 3 subheadings using <h2> tags.",
                options.model
            ),
        )
        .json();

        let completion = backend.complete(&request).await?;
        let article = match serde_json::from_str::<ArticleJson>(completion.content.trim()) {
            Ok(parsed) => finish(parsed.title, parsed.excerpt, parsed.content)?,
            Err(e) => {
                if looks_truncated(&e) {
                    warn!(error = %e, "Theme article JSON was cut off");
                }
                parse_article(&completion.content)?
            }
        };
        info!(title = %article.title, "Article written from theme");
        Ok(article)
    }

    /// Text-to-image prompt for a cover illustration.
    ///
    /// Never fails: without a backend, or when the backend misbehaves, a
    /// generic prompt built from the title is returned.
    #[instrument(level = "debug", skip_all)]
    pub async fn image_prompt(&self, title: &str, content: &str) -> String {
        let fallback = format!("Editorial illustration of {title}, photorealistic, 8k");
        let Some(backend) = self.backend.as_ref() else {
            return fallback;
        };

        let request = ChatRequest::new(
            "You are an AI Art Director. Create a high-quality text-to-image prompt for the \
             following news article.\n\nRULES:\n- Output ONLY the prompt. No introduction, no quotes.\n\
             - Style: Photorealistic, cinematic lighting, 8k, highly detailed.\n\
             - Focus on the main subject or concept.\n\
             - Avoid text, letters, or signboards in the image.\n- Length: 20-40 words.",
            format!(
                "Title: {title}\n\nContent Preview: {}",
                truncate_chars(content, IMAGE_PROMPT_SOURCE_CHARS)
            ),
        )
        .max_tokens(100);

        match backend.complete(&request).await {
            Ok(c) => {
                let prompt = c.content.trim().trim_matches('"').trim().to_string();
                if prompt.is_empty() {
                    fallback
                } else {
                    debug!(%prompt, "Image prompt derived");
                    prompt
                }
            }
            Err(e) => {
                warn!(error = %e, "Image prompt derivation failed; using fallback");
                fallback
            }
        }
    }
}

fn rewrite_system_prompt(options: WritingOptions) -> String {
    format!(
        "You are a senior chief editor at a national news agency. Produce a COMPLETELY NEW article \
         from the facts provided. You are a reporter writing a fresh story, not a summarizer.\n\n\
         RULES:\n\
         1. Restructure the story completely; do not follow the source's order.\n\
         2. Pick one angle and write the whole article from it.\n\
         3. Do not invent numbers or quotes. General context is allowed.\n\
         4. Avoid phrases from the source.\n\
         5. OUTPUT LANGUAGE: {language}. Translate the source first if needed; no mixed languages.\n\n\
         STYLE: {style} - {style_guidance}\n\
         FORMAT: {model} - {model_guidance}\n\n\
         OUTPUT FORMAT (STRICT TAGS):\n\
         [TITLE]\n(Professional title, no clickbait, distinct from the source)\n[/TITLE]\n\
         [EXCERPT]\n(Sharp summary, max 160 chars)\n[/EXCERPT]\n\
         [CONTENT]\n(HTML: every paragraph in <p>, one or two <h2> subheadings, no inline styles, \
         no \"Baca Juga\", no links)\n[/CONTENT]",
        language = options.language.display_name(),
        style = options.style,
        style_guidance = options.style.guidance(),
        model = options.model,
        model_guidance = options.model.guidance(),
    )
}

fn theme_system_prompt(subject: &str, category: &str, options: WritingOptions) -> String {
    format!(
        "You are a senior journalist. Write a high-quality news article based on the theme.\n\n\
         OUTPUT LANGUAGE: {language}\n\n\
         ARTICLE PARAMETERS:\n- Theme: {subject}\n- Category: {category}\n\
         - Style: {style} ({style_guidance})\n- Model: {model} ({model_guidance})\n\n\
         STRICT HTML RULES:\n\
         1. Every new section starts with an <h2>.\n\
         2. Never use bold text as a standalone heading line.\n\
         3. Wrap article text in <p> tags; the content never starts with <h2>.\n\
         4. Return exactly this JSON structure:\n\
         {{\"title\": \"...\", \"excerpt\": \"...\", \"content\": \"<p>Lead paragraph</p><h2>Subheading</h2><p>...</p>\"}}",
        language = options.language.display_name(),
        style = options.style,
        style_guidance = options.style.guidance(),
        model = options.model,
        model_guidance = options.model.guidance(),
    )
}

/// Parse a backend answer in tagged form, falling back to a JSON object.
pub fn parse_article(raw: &str) -> Result<RewrittenArticle, PipelineError> {
    let tag = |re: &Regex| {
        re.captures(raw)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default()
    };

    let content = tag(&CONTENT_TAG);
    if !content.is_empty() {
        return finish(tag(&TITLE_TAG), tag(&EXCERPT_TAG), content);
    }

    if let Some(parsed) = json_object(raw) {
        return finish(parsed.title, parsed.excerpt, parsed.content);
    }

    if is_refusal(raw) {
        warn!(response = %truncate_for_log(raw, 200), "Backend declined to write the article");
        return Err(BackendError::Refused(truncate_for_log(raw.trim(), 200)).into());
    }

    warn!(response = %truncate_for_log(raw, 300), "Unrecognised rewrite response");
    Err(PipelineError::UpstreamRejected(if raw.trim().is_empty() {
        "text backend returned an empty response".to_string()
    } else {
        "text backend response carried no article content".to_string()
    }))
}

fn json_object(raw: &str) -> Option<ArticleJson> {
    if let Some(c) = FENCED_JSON.captures(raw) {
        if let Ok(parsed) = serde_json::from_str(&c[1]) {
            return Some(parsed);
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn finish(title: String, excerpt: String, content: String) -> Result<RewrittenArticle, PipelineError> {
    let title = title.trim().to_string();
    let content = content.trim().to_string();
    if title.is_empty() {
        return Err(PipelineError::UpstreamRejected(
            "text backend response is missing a title".to_string(),
        ));
    }
    if content.is_empty() {
        return Err(PipelineError::UpstreamRejected(
            "text backend returned an article with empty content".to_string(),
        ));
    }
    let excerpt = match excerpt.trim() {
        "" => truncate_chars(&title, EXCERPT_CHARS).to_string(),
        e => e.to_string(),
    };
    Ok(RewrittenArticle {
        title,
        content,
        excerpt,
    })
}

fn is_refusal(raw: &str) -> bool {
    let lower = raw.trim_start().to_lowercase();
    let head = truncate_chars(&lower, 200);
    REFUSAL_MARKERS.iter().any(|m| head.contains(m))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::Completion;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Backend answering from a fixed script, one entry per call.
    pub(crate) struct ScriptedBackend {
        pub replies: Mutex<Vec<Result<String, BackendError>>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextBackend for ScriptedBackend {
        async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            let next = if replies.is_empty() {
                Err(BackendError::Unavailable("script exhausted".into()))
            } else {
                replies.remove(0)
            };
            next.map(|content| Completion {
                content,
                finish_reason: Some("stop".into()),
            })
        }
    }

    const TAGGED: &str = "[TITLE]\nJudul Baru\n[/TITLE]\n[EXCERPT]\nRingkas.\n[/EXCERPT]\n[CONTENT]\n<p>Isi.</p>\n[/CONTENT]";

    #[test]
    fn test_parse_tagged() {
        let a = parse_article(TAGGED).unwrap();
        assert_eq!(a.title, "Judul Baru");
        assert_eq!(a.excerpt, "Ringkas.");
        assert_eq!(a.content, "<p>Isi.</p>");
    }

    #[test]
    fn test_parse_json_fallback_and_default_excerpt() {
        let raw = "Here you go:\n```json\n{\"title\": \"T\", \"content\": \"<p>c</p>\"}\n```";
        let a = parse_article(raw).unwrap();
        assert_eq!(a.title, "T");
        assert_eq!(a.excerpt, "T");
    }

    #[test]
    fn test_untagged_output_is_rejected_not_passed_through() {
        let err = parse_article("Just some prose without any tags.").unwrap_err();
        assert_eq!(err.kind(), "upstream_rejected");
        let err = parse_article("   ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_empty_content_tag_is_rejected() {
        let err = parse_article("[TITLE]x[/TITLE][CONTENT]  [/CONTENT]").unwrap_err();
        assert_eq!(err.kind(), "upstream_rejected");
    }

    #[test]
    fn test_refusal_detected() {
        let err = parse_article("I'm sorry, but I can't help with that request.").unwrap_err();
        assert!(err.to_string().contains("content policy"));
    }

    #[tokio::test]
    async fn test_rewrite_without_backend_is_configuration_error() {
        let rewriter = Rewriter::new(None, 100);
        let err = rewriter
            .rewrite("t", "c", "s", WritingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_rewrite_truncates_source_and_carries_options() {
        let backend = ScriptedBackend::new(vec![Ok(TAGGED.to_string())]);
        let rewriter = Rewriter::new(Some(backend.clone()), 10);
        let options = WritingOptions {
            style: NewsStyle::Investigatif,
            model: NewsModel::Editorial,
            language: Language::En,
        };
        rewriter
            .rewrite("Old", &"x".repeat(50), "Tempo", options)
            .await
            .unwrap();

        let requests = backend.requests.lock().unwrap();
        assert!(requests[0].user.contains(&format!("{}\n", "x".repeat(10))));
        assert!(!requests[0].user.contains(&"x".repeat(11)));
        assert!(requests[0].system.contains("Investigatif"));
        assert!(requests[0].system.contains("English"));
    }

    #[tokio::test]
    async fn test_theme_json() {
        let backend = ScriptedBackend::new(vec![Ok(
            r#"{"title":"Banjir","excerpt":"E","content":"<p>Isi</p>"}"#.to_string(),
        )]);
        let rewriter = Rewriter::new(Some(backend.clone()), 100);
        let a = rewriter
            .write_from_theme("Banjir", "Umum", Some(THEME_VARIATIONS[1]), WritingOptions::default())
            .await
            .unwrap();
        assert_eq!(a.title, "Banjir");
        let requests = backend.requests.lock().unwrap();
        assert!(requests[0].json_mode);
        assert!(requests[0].system.contains("dampak ekonomi"));
    }

    #[tokio::test]
    async fn test_empty_theme_is_validation_error() {
        let rewriter = Rewriter::new(Some(ScriptedBackend::new(vec![])), 100);
        let err = rewriter
            .write_from_theme(" ", "Umum", None, WritingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_image_prompt_fallbacks() {
        let rewriter = Rewriter::new(None, 100);
        assert_eq!(
            rewriter.image_prompt("Gempa", "isi").await,
            "Editorial illustration of Gempa, photorealistic, 8k"
        );

        let failing = Rewriter::new(
            Some(ScriptedBackend::new(vec![Err(BackendError::Unavailable("x".into()))])),
            100,
        );
        assert!(failing.image_prompt("Gempa", "isi").await.contains("Gempa"));

        let working = Rewriter::new(
            Some(ScriptedBackend::new(vec![Ok("\"A cracked road at dawn\"".into())])),
            100,
        );
        assert_eq!(working.image_prompt("Gempa", "isi").await, "A cracked road at dawn");
    }
}
