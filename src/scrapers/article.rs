//! Main-text extraction from arbitrary article pages.
//!
//! Pages are cleaned of boilerplate regions first, then the body is taken
//! from the best-ranked container: known site layouts, then generic
//! `article`/`main` wrappers, then the largest cluster of sibling
//! paragraphs, and finally the raw text of `<body>` split on blank lines.

use once_cell::sync::Lazy;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{ExtractConfig, HttpConfig};
use crate::error::PipelineError;
use crate::models::ExtractedContent;
use crate::utils::{collapse_whitespace, truncate_chars};

static JUNK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        "script, style, noscript, iframe, svg, nav, header, footer, aside, \
         .advertisement, .ads, .ad-container, #ads, \
         .social-share, .share-buttons, .share-box, \
         .related-articles, .baca-juga, .read-also, .related-news, \
         .tags, .topics, .breadcrumb, \
         .author-bio, .author-info, .date, .timestamp, \
         .comment-section, #comments, .newsletter, .subscription, \
         .copyright, .disclaimer, .promo, .banner",
    )
    .unwrap()
});

/// Body containers, most specific first.
static CONTAINERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        ".detail__body-text",
        ".read__content",
        ".detail-text",
        ".article-content",
        ".post-content",
        ".entry-content",
        ".content-detail",
        "article",
        "main",
        "#content",
        ".content",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

static TITLE_TEXT: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["h1.title", "h1.article-title", "h1"]
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
});
static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static DOC_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

static OG_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:image"]"#).unwrap());
static IMAGES: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        ".detail__media-image img",
        ".photo__img img",
        "article img",
        ".article-img img",
        "img",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static META_AUTHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="author"]"#).unwrap());
static BYLINES: Lazy<Vec<Selector>> = Lazy::new(|| {
    [".author", ".detail__author", r#"[rel="author"]"#]
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
});

/// Lower-cased phrases that mark a paragraph as navigation or boilerplate.
const PARAGRAPH_STOP_PHRASES: &[&str] = &[
    "baca juga",
    "copyright",
    "halaman selanjutnya",
    "scroll to continue",
];

pub struct ArticleExtractor {
    client: Client,
    limits: ExtractConfig,
}

impl ArticleExtractor {
    pub fn new(http: &HttpConfig, limits: ExtractConfig) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        if let Ok(lang) = HeaderValue::from_str(&http.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }
        let client = Client::builder()
            .user_agent(&http.user_agent)
            .default_headers(headers)
            .timeout(http.page_timeout())
            .gzip(true)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client, limits })
    }

    /// Fetch `url` and isolate its article text.
    ///
    /// Transport failures are `UpstreamUnavailable`; a page that answers but
    /// blocks us or carries no usable text is `Extraction`.
    #[instrument(level = "info", skip(self))]
    pub async fn extract(&self, url: &str) -> Result<ExtractedContent, PipelineError> {
        let page_url = Url::parse(url)
            .map_err(|e| PipelineError::Validation(format!("invalid article URL '{url}': {e}")))?;

        let response = self.client.get(page_url.clone()).send().await.map_err(|e| {
            warn!(error = %e, "Article fetch failed");
            PipelineError::UpstreamUnavailable(format!("fetching {url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Article page refused");
            return Err(PipelineError::Extraction(format!(
                "page answered HTTP {status}"
            )));
        }

        let body = response.text().await.map_err(|e| {
            PipelineError::UpstreamUnavailable(format!("reading {url}: {e}"))
        })?;

        let extracted = extract_from_html(&body, &page_url, &self.limits)?;
        info!(
            title = %truncate_chars(&extracted.title, 50),
            chars = extracted.body_text.chars().count(),
            "Extracted article"
        );
        Ok(extracted)
    }
}

/// Extract from an already downloaded page.
pub fn extract_from_html(
    html: &str,
    page_url: &Url,
    limits: &ExtractConfig,
) -> Result<ExtractedContent, PipelineError> {
    let mut document = Html::parse_document(html);
    strip_junk(&mut document);

    let title = find_title(&document).unwrap_or_default();
    let image_url = find_image(&document, page_url);
    let byline = find_byline(&document);

    let paragraphs = body_paragraphs(&document, limits.min_paragraph_chars);
    let body = paragraphs.join("\n\n");
    let body_text = truncate_chars(body.trim(), limits.max_chars).to_string();

    if body_text.is_empty() {
        return Err(PipelineError::Extraction(
            "no usable article text found on page".to_string(),
        ));
    }

    Ok(ExtractedContent {
        title,
        body_text,
        source_url: page_url.to_string(),
        byline,
        image_url,
    })
}

fn strip_junk(document: &mut Html) {
    let junk: Vec<_> = document.select(&JUNK).map(|el| el.id()).collect();
    debug!(count = junk.len(), "Removing boilerplate nodes");
    for id in junk {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn keep_paragraph(text: &str, min_chars: usize) -> bool {
    if text.chars().count() <= min_chars {
        return false;
    }
    let lower = text.to_lowercase();
    !PARAGRAPH_STOP_PHRASES.iter().any(|p| lower.contains(p))
}

fn paragraphs_in(container: ElementRef<'_>, min_chars: usize) -> Vec<String> {
    container
        .select(&PARAGRAPH)
        .map(element_text)
        .filter(|t| keep_paragraph(t, min_chars))
        .collect()
}

fn body_paragraphs(document: &Html, min_chars: usize) -> Vec<String> {
    for selector in CONTAINERS.iter() {
        if let Some(container) = document.select(selector).next() {
            let paragraphs = paragraphs_in(container, min_chars);
            if !paragraphs.is_empty() {
                return paragraphs;
            }
        }
    }

    // Largest cluster of sibling paragraphs, by total text length.
    let mut clusters: HashMap<_, Vec<String>> = HashMap::new();
    let mut order = Vec::new();
    for p in document.select(&PARAGRAPH) {
        let text = element_text(p);
        if !keep_paragraph(&text, min_chars) {
            continue;
        }
        let Some(parent) = p.parent() else { continue };
        let id = parent.id();
        if !clusters.contains_key(&id) {
            order.push(id);
        }
        clusters.entry(id).or_default().push(text);
    }
    let best = order
        .into_iter()
        .filter_map(|id| clusters.remove(&id))
        .max_by_key(|ps| ps.iter().map(String::len).sum::<usize>());
    if let Some(paragraphs) = best {
        return paragraphs;
    }

    // Sites that lay out text with <div>/<br>.
    document
        .select(&BODY)
        .next()
        .map(|body| {
            body.text()
                .collect::<String>()
                .split("\n\n")
                .map(collapse_whitespace)
                .filter(|t| t.chars().count() > min_chars)
                .collect()
        })
        .unwrap_or_default()
}

fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|s| {
        document
            .select(s)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
    })
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

fn find_title(document: &Html) -> Option<String> {
    first_text(document, &TITLE_TEXT)
        .or_else(|| meta_content(document, &OG_TITLE))
        .or_else(|| {
            document
                .select(&DOC_TITLE)
                .next()
                .map(element_text)
                .filter(|t| !t.is_empty())
        })
}

fn find_image(document: &Html, page_url: &Url) -> Option<String> {
    let raw = meta_content(document, &OG_IMAGE).or_else(|| {
        IMAGES.iter().find_map(|s| {
            document
                .select(s)
                .find_map(|img| img.value().attr("src"))
                .map(str::to_string)
        })
    })?;
    page_url.join(raw.trim()).ok().map(|u| u.to_string())
}

fn find_byline(document: &Html) -> Option<String> {
    meta_content(document, &META_AUTHOR).or_else(|| first_text(document, &BYLINES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DETIK_LIKE: &str = r#"<html><head>
        <title>Judul Dokumen</title>
        <meta property="og:image" content="/images/lead.jpg">
        <meta name="author" content="Tim Redaksi">
        </head><body>
        <nav><p>Beranda Nasional Ekonomi Olahraga Teknologi</p></nav>
        <h1 class="title">Harga Beras Naik Tajam</h1>
        <div class="detail__body-text">
          <p>Harga beras di pasar induk naik hingga dua puluh persen pekan ini.</p>
          <div class="baca-juga"><p>Baca juga: artikel lain yang tidak relevan sama sekali</p></div>
          <p>Baca juga: Harga cabai ikut melonjak di beberapa daerah</p>
          <p>Pendek.</p>
          <script>var tracking = "should never appear in the text";</script>
          <p>Pemerintah berjanji melakukan operasi pasar mulai besok pagi.</p>
        </div>
        <footer><p>Copyright 2024 Media Contoh. All rights reserved.</p></footer>
        </body></html>"#;

    fn page() -> Url {
        Url::parse("https://news.example/read/1").unwrap()
    }

    #[test]
    fn test_site_container_and_filters() {
        let out = extract_from_html(DETIK_LIKE, &page(), &ExtractConfig::default()).unwrap();
        assert_eq!(out.title, "Harga Beras Naik Tajam");
        assert_eq!(
            out.body_text,
            "Harga beras di pasar induk naik hingga dua puluh persen pekan ini.\n\n\
             Pemerintah berjanji melakukan operasi pasar mulai besok pagi."
        );
        assert_eq!(out.byline.as_deref(), Some("Tim Redaksi"));
        assert_eq!(
            out.image_url.as_deref(),
            Some("https://news.example/images/lead.jpg")
        );
        assert!(!out.body_text.contains("tracking"));
    }

    #[test]
    fn test_largest_paragraph_cluster_fallback() {
        let html = r#"<html><body>
            <div id="teaser"><p>Teaser paragraph that is long enough to keep.</p></div>
            <div id="story">
              <p>First real paragraph of the story with plenty of words in it.</p>
              <p>Second real paragraph of the story with plenty of words too.</p>
            </div></body></html>"#;
        let out = extract_from_html(html, &page(), &ExtractConfig::default()).unwrap();
        assert!(out.body_text.starts_with("First real paragraph"));
        assert!(!out.body_text.contains("Teaser"));
    }

    #[test]
    fn test_text_cap() {
        let long = "Kalimat panjang yang terus diulang. ".repeat(1000);
        let html = format!("<html><body><article><p>{long}</p></article></body></html>");
        let limits = ExtractConfig {
            max_chars: 100,
            ..ExtractConfig::default()
        };
        let out = extract_from_html(&html, &page(), &limits).unwrap();
        assert_eq!(out.body_text.chars().count(), 100);
    }

    #[test]
    fn test_page_without_text_is_extraction_failure() {
        let html = "<html><body><nav>Menu</nav><p>Short</p></body></html>";
        let err = extract_from_html(html, &page(), &ExtractConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_blocked_page_is_typed_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocked"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access denied"))
            .mount(&server)
            .await;

        let extractor =
            ArticleExtractor::new(&HttpConfig::default(), ExtractConfig::default()).unwrap();
        let err = extractor
            .extract(&format!("{}/blocked", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));

        let err = extractor.extract("http://127.0.0.1:1/x").await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_extract_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DETIK_LIKE))
            .mount(&server)
            .await;

        let extractor =
            ArticleExtractor::new(&HttpConfig::default(), ExtractConfig::default()).unwrap();
        let out = extractor
            .extract(&format!("{}/read/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(out.source_url, format!("{}/read/1", server.uri()));
        assert!(out.image_url.unwrap().ends_with("/images/lead.jpg"));
    }
}
