//! Feed aggregation.
//!
//! Every selected feed is fetched concurrently under its own timeout. A
//! failing feed never aborts the others: its outcome is captured as a
//! [`FeedFailure`] and it contributes zero items.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use itertools::Itertools;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::feed_parser::{ParsedEntry, parse_feed};
use crate::config::{FeedSource, HttpConfig};
use crate::error::{FeedError, PipelineError};
use crate::models::FeedItem;

/// Items returned for an ad-hoc feed URL are capped at this count.
pub const CUSTOM_FEED_ITEM_LIMIT: usize = 50;

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml, */*";

/// A feed that contributed nothing, and why.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedFailure {
    pub feed_id: String,
    pub feed_name: String,
    pub error: String,
    #[serde(skip)]
    pub cause: FeedError,
}

/// Result of aggregating several feeds.
#[derive(Debug, Default, Serialize)]
pub struct Aggregation {
    pub items: Vec<FeedItem>,
    pub failures: Vec<FeedFailure>,
}

/// Result of fetching one caller-supplied feed URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFeed {
    pub feed_title: String,
    pub items: Vec<FeedItem>,
}

pub struct FeedAggregator {
    client: Client,
    catalog: Vec<FeedSource>,
    timeout: Duration,
}

impl FeedAggregator {
    pub fn new(http: &HttpConfig, catalog: Vec<FeedSource>) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));
        if let Ok(lang) = HeaderValue::from_str(&http.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }
        let client = Client::builder()
            .user_agent(&http.user_agent)
            .default_headers(headers)
            .timeout(http.feed_timeout())
            .gzip(true)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            catalog,
            timeout: http.feed_timeout(),
        })
    }

    pub fn catalog(&self) -> &[FeedSource] {
        &self.catalog
    }

    /// Fetch the named feeds, or the whole catalog when `feed_ids` is empty.
    ///
    /// Unknown ids are reported as failures alongside unreachable feeds.
    #[instrument(level = "info", skip_all, fields(requested = feed_ids.len()))]
    pub async fn aggregate(&self, feed_ids: &[String]) -> Aggregation {
        let mut failures = Vec::new();
        let selected: Vec<FeedSource> = if feed_ids.is_empty() {
            self.catalog.clone()
        } else {
            feed_ids
                .iter()
                .filter_map(|id| match self.catalog.iter().find(|f| &f.id == id) {
                    Some(feed) => Some(feed.clone()),
                    None => {
                        warn!(feed_id = %id, "Unknown feed id");
                        let cause = FeedError::UnknownFeed(id.clone());
                        failures.push(FeedFailure {
                            feed_id: id.clone(),
                            feed_name: id.clone(),
                            error: cause.to_string(),
                            cause,
                        });
                        None
                    }
                })
                .collect()
        };

        let outcomes = join_all(selected.iter().map(|feed| async move {
            let result = self.fetch_bounded(feed).await;
            (feed, result)
        }))
        .await;

        let mut items = Vec::new();
        for (feed, result) in outcomes {
            match result {
                Ok(feed_items) => items.extend(feed_items),
                Err(cause) => {
                    warn!(feed_id = %feed.id, error = %cause, "Feed contributed no items");
                    failures.push(FeedFailure {
                        feed_id: feed.id.clone(),
                        feed_name: feed.name.clone(),
                        error: cause.to_string(),
                        cause,
                    });
                }
            }
        }

        let items: Vec<FeedItem> = items.into_iter().unique_by(|i| i.link.clone()).collect();
        info!(
            items = items.len(),
            feeds = selected.len(),
            failed = failures.len(),
            "Aggregated feeds"
        );
        Aggregation { items, failures }
    }

    /// Fetch an arbitrary feed URL, surfacing the typed error directly.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_custom(&self, url: &str) -> Result<CustomFeed, FeedError> {
        let parsed = Url::parse(url).map_err(|_| FeedError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FeedError::InvalidUrl(url.to_string()));
        }

        let body = self.download(url).await?;
        let feed = parse_feed(&body)?;
        let feed_title = feed
            .title
            .clone()
            .unwrap_or_else(|| "Custom Feed".to_string());
        let items: Vec<FeedItem> = feed
            .entries
            .iter()
            .filter_map(|e| to_item(e, &feed_title))
            .take(CUSTOM_FEED_ITEM_LIMIT)
            .collect();
        if items.is_empty() {
            return Err(FeedError::Empty);
        }
        info!(count = items.len(), %feed_title, "Fetched custom feed");
        Ok(CustomFeed { feed_title, items })
    }

    /// Fetch one catalog feed under the configured timeout.
    async fn fetch_bounded(&self, feed: &FeedSource) -> Result<Vec<FeedItem>, FeedError> {
        match tokio::time::timeout(self.timeout, self.fetch_one(feed)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout),
        }
    }

    #[instrument(level = "debug", skip_all, fields(feed_id = %feed.id, url = %feed.url))]
    async fn fetch_one(&self, feed: &FeedSource) -> Result<Vec<FeedItem>, FeedError> {
        let body = self.download(&feed.url).await?;
        let parsed = parse_feed(&body)?;
        let items: Vec<FeedItem> = parsed
            .entries
            .iter()
            .filter_map(|e| to_item(e, &feed.name))
            .collect();
        if items.is_empty() {
            return Err(FeedError::Empty);
        }
        debug!(count = items.len(), "Parsed feed");
        Ok(items)
    }

    async fn download(&self, url: &str) -> Result<String, FeedError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::from_reqwest(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::from_status(status));
        }
        response.text().await.map_err(|e| FeedError::from_reqwest(&e))
    }
}

/// Normalize a parsed entry; entries without a link cannot be extracted and
/// are dropped.
fn to_item(entry: &ParsedEntry, source_name: &str) -> Option<FeedItem> {
    let link = entry.link.clone().filter(|l| !l.is_empty())?;
    let image_url = entry.image();
    Some(FeedItem {
        title: entry
            .title
            .clone()
            .unwrap_or_else(|| "Untitled".to_string()),
        link,
        source_name: source_name.to_string(),
        published_at: entry.published.as_deref().and_then(parse_date),
        has_image_hint: image_url.is_some(),
        image_url,
        summary: entry.content.clone().or_else(|| entry.summary.clone()),
        author: entry.author.clone(),
    })
}

/// RSS uses RFC 2822 dates, Atom uses RFC 3339.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(items: &[(&str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(title, link)| {
                format!("<item><title>{title}</title><link>{link}</link><pubDate>Mon, 21 Oct 2024 07:28:00 GMT</pubDate></item>")
            })
            .collect();
        format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Mock</title>{body}</channel></rss>"#)
    }

    fn source(id: &str, url: String) -> FeedSource {
        FeedSource {
            id: id.to_string(),
            name: format!("{id} name"),
            url,
            category: String::new(),
            country: String::new(),
        }
    }

    fn http(timeout_secs: u64) -> HttpConfig {
        HttpConfig {
            feed_timeout_secs: timeout_secs,
            ..HttpConfig::default()
        }
    }

    async fn mount(server: &MockServer, route: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_unreachable_feed_does_not_abort_others() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/a",
            ResponseTemplate::new(200).set_body_string(rss(&[("A1", "https://a/1"), ("A2", "https://a/2")])),
        )
        .await;
        mount(
            &server,
            "/b",
            ResponseTemplate::new(200).set_body_string(rss(&[("B1", "https://b/1")])),
        )
        .await;

        let catalog = vec![
            source("a", format!("{}/a", server.uri())),
            source("dead", "http://127.0.0.1:1/rss".to_string()),
            source("b", format!("{}/b", server.uri())),
        ];
        let aggregator = FeedAggregator::new(&http(5), catalog).unwrap();
        let result = aggregator
            .aggregate(&["a".into(), "dead".into(), "b".into()])
            .await;

        assert_eq!(result.items.len(), 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].feed_id, "dead");
        assert!(result.items.iter().any(|i| i.source_name == "b name"));
        assert!(result.items.iter().all(|i| i.published_at.is_some()));
    }

    #[tokio::test]
    async fn test_empty_selection_means_all_feeds_and_dedups_links() {
        let server = MockServer::start().await;
        mount(&server, "/a", ResponseTemplate::new(200).set_body_string(rss(&[("Same", "https://x/1")]))).await;
        mount(&server, "/b", ResponseTemplate::new(200).set_body_string(rss(&[("Same again", "https://x/1")]))).await;

        let catalog = vec![
            source("a", format!("{}/a", server.uri())),
            source("b", format!("{}/b", server.uri())),
        ];
        let aggregator = FeedAggregator::new(&http(5), catalog).unwrap();
        let result = aggregator.aggregate(&[]).await;
        assert_eq!(result.items.len(), 1);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_feed_id_is_a_failure_entry() {
        let aggregator = FeedAggregator::new(&http(5), vec![]).unwrap();
        let result = aggregator.aggregate(&["nope".into()]).await;
        assert!(result.items.is_empty());
        assert_eq!(result.failures[0].cause, FeedError::UnknownFeed("nope".into()));
    }

    #[tokio::test]
    async fn test_custom_feed_error_taxonomy() {
        let server = MockServer::start().await;
        mount(&server, "/missing", ResponseTemplate::new(404)).await;
        mount(&server, "/empty", ResponseTemplate::new(200).set_body_string(rss(&[]))).await;
        mount(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(rss(&[("S", "https://s/1")]))
                .set_delay(Duration::from_secs(3)),
        )
        .await;

        let aggregator = FeedAggregator::new(&http(1), vec![]).unwrap();
        let missing = aggregator.fetch_custom(&format!("{}/missing", server.uri())).await;
        assert_eq!(missing.unwrap_err(), FeedError::NotFound);

        let empty = aggregator.fetch_custom(&format!("{}/empty", server.uri())).await;
        assert_eq!(empty.unwrap_err(), FeedError::Empty);

        let slow = aggregator.fetch_custom(&format!("{}/slow", server.uri())).await;
        assert_eq!(slow.unwrap_err(), FeedError::Timeout);

        let invalid = aggregator.fetch_custom("not a url").await;
        assert!(matches!(invalid.unwrap_err(), FeedError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_custom_feed_caps_items() {
        let server = MockServer::start().await;
        let links: Vec<(String, String)> = (0..60)
            .map(|i| (format!("T{i}"), format!("https://c/{i}")))
            .collect();
        let refs: Vec<(&str, &str)> = links.iter().map(|(t, l)| (t.as_str(), l.as_str())).collect();
        mount(&server, "/big", ResponseTemplate::new(200).set_body_string(rss(&refs))).await;

        let aggregator = FeedAggregator::new(&http(5), vec![]).unwrap();
        let feed = aggregator.fetch_custom(&format!("{}/big", server.uri())).await.unwrap();
        assert_eq!(feed.feed_title, "Mock");
        assert_eq!(feed.items.len(), CUSTOM_FEED_ITEM_LIMIT);
        assert_eq!(feed.items[0].source_name, "Mock");
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Mon, 21 Oct 2024 07:28:00 +0700").is_some());
        assert!(parse_date("2024-10-21T08:00:00Z").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
