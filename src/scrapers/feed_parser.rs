//! Streaming RSS 2.0 / RDF / Atom parser.
//!
//! Feeds in the wild are inconsistent, so this is a tolerant event walker
//! rather than a schema deserializer: it recognises the handful of elements
//! the pipeline needs and ignores everything else.

use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use std::borrow::Cow;

use crate::error::FeedError;

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img[^>]+src=["']([^"'>]+)["']"#).unwrap());

/// Channel-level result of a parse.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

/// One `<item>` or `<entry>`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    /// Raw date string as found in the feed.
    pub published: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
}

impl ParsedEntry {
    /// Image declared in markup, or the first `<img>` in the inline HTML.
    pub fn image(&self) -> Option<String> {
        self.image_url.clone().or_else(|| {
            [self.content.as_deref(), self.summary.as_deref()]
                .into_iter()
                .flatten()
                .find_map(|html| IMG_SRC.captures(html).map(|c| c[1].to_string()))
        })
    }
}

/// Parse a feed document.
///
/// Fails with [`FeedError::Parse`] when the XML is malformed or the root
/// element is not `rss`, `rdf:RDF` or `feed`.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, FeedError> {
    let mut reader = Reader::from_str(xml);
    let mut feed = ParsedFeed::default();
    let mut current: Option<ParsedEntry> = None;
    let mut text = String::new();
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                if depth == 0 {
                    check_root(&name)?;
                    saw_root = true;
                }
                depth += 1;
                text.clear();
                if name == "item" || name == "entry" {
                    current = Some(ParsedEntry::default());
                } else if let Some(entry) = current.as_mut() {
                    apply_attributes(entry, &name, &e);
                }
            }
            Ok(Event::Empty(e)) => {
                let name = element_name(&e);
                if depth == 0 {
                    check_root(&name)?;
                    saw_root = true;
                }
                if let Some(entry) = current.as_mut() {
                    apply_attributes(entry, &name, &e);
                }
            }
            Ok(Event::Text(t)) => {
                let raw = String::from_utf8_lossy(&t);
                match quick_xml::escape::unescape(&raw) {
                    Ok(unescaped) => text.push_str(&unescaped),
                    Err(_) => text.push_str(&raw),
                }
            }
            Ok(Event::CData(c)) => text.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::GeneralRef(r)) => {
                push_entity(&mut text, &String::from_utf8_lossy(&r));
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let value = text.trim().to_string();
                text.clear();

                if name == "item" || name == "entry" {
                    if let Some(entry) = current.take() {
                        feed.entries.push(entry);
                    }
                    continue;
                }

                match current.as_mut() {
                    Some(entry) => apply_text(entry, &name, value),
                    None => {
                        if name == "title" && feed.title.is_none() && !value.is_empty() {
                            feed.title = Some(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(FeedError::Parse(format!(
                    "{} at byte {}",
                    e,
                    reader.error_position()
                )));
            }
        }
    }

    if !saw_root {
        return Err(FeedError::Parse("document has no root element".to_string()));
    }
    Ok(feed)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn check_root(name: &str) -> Result<(), FeedError> {
    match name {
        "rss" | "feed" | "rdf:RDF" | "RDF" => Ok(()),
        other => Err(FeedError::Parse(format!(
            "unexpected root element <{other}>"
        ))),
    }
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() != key.as_bytes() {
            return None;
        }
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        Some(match quick_xml::escape::unescape(&raw) {
            Ok(Cow::Owned(s)) => s,
            _ => raw,
        })
    })
}

/// Attribute-carried data: Atom links and media references.
fn apply_attributes(entry: &mut ParsedEntry, name: &str, e: &BytesStart<'_>) {
    match name {
        "link" => {
            let Some(href) = attribute(e, "href") else {
                return;
            };
            match attribute(e, "rel").as_deref() {
                None | Some("alternate") => {
                    if entry.link.is_none() {
                        entry.link = Some(href);
                    }
                }
                Some("enclosure") => {
                    let is_image = attribute(e, "type")
                        .map(|t| t.starts_with("image/"))
                        .unwrap_or(false);
                    if is_image && entry.image_url.is_none() {
                        entry.image_url = Some(href);
                    }
                }
                _ => {}
            }
        }
        "media:content" | "media:thumbnail" | "enclosure" => {
            if entry.image_url.is_some() {
                return;
            }
            let is_image = match (attribute(e, "type"), attribute(e, "medium")) {
                (Some(t), _) => t.starts_with("image/"),
                (None, Some(m)) => m == "image",
                (None, None) => true,
            };
            if is_image {
                entry.image_url = attribute(e, "url");
            }
        }
        _ => {}
    }
}

fn apply_text(entry: &mut ParsedEntry, name: &str, value: String) {
    if value.is_empty() {
        return;
    }
    match name {
        "title" => entry.title = Some(value),
        "link" => {
            if entry.link.is_none() {
                entry.link = Some(value);
            }
        }
        "guid" | "id" => {
            if entry.link.is_none() && value.starts_with("http") {
                entry.link = Some(value);
            }
        }
        "pubDate" | "published" | "dc:date" => entry.published = Some(value),
        "updated" => {
            if entry.published.is_none() {
                entry.published = Some(value);
            }
        }
        "description" | "summary" => entry.summary = Some(value),
        "content:encoded" | "content" => entry.content = Some(value),
        "dc:creator" | "author" | "name" => {
            if entry.author.is_none() {
                entry.author = Some(value);
            }
        }
        _ => {}
    }
}

fn push_entity(text: &mut String, name: &str) {
    let resolved = if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => num.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
    } else {
        match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => None,
        }
    };
    match resolved {
        Some(c) => text.push(c),
        None => {
            text.push('&');
            text.push_str(name);
            text.push(';');
        }
    }
}
