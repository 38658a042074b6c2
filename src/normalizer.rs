//! Block-structure normalization of generated article bodies.
//!
//! Input may be finished HTML, prose with blank lines, or a single run-on
//! block. The output is always block markup (`<p>`, `<h2>`, `<ul>`/`<ol>`)
//! and `normalize(normalize(x)) == normalize(x)`. Only allow-listed tags
//! survive, and the only attribute kept is an http(s), mailto or relative
//! link target.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::{collapse_whitespace, escape_html};

/// Sentences per synthetic paragraph when the input has no blank lines.
pub const SENTENCES_PER_PARAGRAPH: usize = 3;

const HEADING_MIN_CHARS: usize = 5;
const HEADING_MAX_CHARS: usize = 100;

static DANGEROUS_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|iframe|object|embed|noscript|template)\b[^>]*>.*?</(script|style|iframe|object|embed|noscript|template)\s*>|<(script|style|iframe|object|embed|noscript|template)\b[^>]*/?>")
        .unwrap()
});
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?(-->|$)").unwrap());
static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\shref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'<>`]+))"#).unwrap()
});
static BLOCK_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(p|h[1-6]|ul|ol|blockquote)(\s[^>]*)?>").unwrap());
static BLOCK_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|h[1-6]|ul|ol|blockquote)\s*>").unwrap());
static BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r]*\n").unwrap());
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:(\d{1,3})[.)]|[-•*])\s+").unwrap());
static MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+").unwrap());
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?([a-zA-Z][a-zA-Z0-9]*)\b[^<>]*>").unwrap());
static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,31});").unwrap());

const INLINE_TAGS: &[&str] = &["a", "b", "strong", "i", "em", "u", "br"];
const BLOCK_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "blockquote",
];
const SAFE_HREF_PREFIXES: &[&str] = &["https://", "http://", "mailto:", "/", "#"];

/// Normalize `raw` into block markup. Blank input yields an empty string.
pub fn normalize(raw: &str) -> String {
    let clean = sanitize(raw);
    let clean = clean.trim();
    if clean.is_empty() {
        return String::new();
    }
    if is_formatted(clean) {
        return clean.to_string();
    }

    let text = clean.replace("\r\n", "\n");
    let mut blocks: Vec<String> = BLANK_LINE
        .split(&text)
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect();
    // Headings only come from author-delimited blocks, never from
    // synthetic sentence groups.
    let allow_headings = blocks.len() > 1;
    if !allow_headings {
        blocks = group_sentences(&text, SENTENCES_PER_PARAGRAPH);
    }

    let rendered: Vec<String> = blocks
        .iter()
        .map(|b| render_block(b, allow_headings))
        .filter(|b| !b.is_empty())
        .collect();

    if rendered.is_empty() {
        // Input was nothing but stripped markup.
        return String::new();
    }
    rendered.join("\n")
}

/// Drop executable regions, then re-emit allow-listed tags without their
/// attributes and escape everything else.
fn sanitize(raw: &str) -> String {
    let mut text = raw.to_string();
    // A removal can splice its neighbours into a new element, so repeat
    // until nothing matches.
    loop {
        let next = COMMENT.replace_all(&text, "");
        let next = DANGEROUS_BLOCKS.replace_all(&next, "").into_owned();
        if next == text {
            break;
        }
        text = next;
    }
    rebuild_tags(&text)
}

fn rebuild_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in TAG.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&escape_text(&s[last..m.start()]));
        if let Some(tag) = canonical_tag(m.as_str(), &caps[1]) {
            out.push_str(&tag);
        }
        last = m.end();
    }
    out.push_str(&escape_text(&s[last..]));
    out
}

/// `<name>`/`</name>` for allowed tags; links keep a safe `href` only.
fn canonical_tag(tag: &str, name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    if !BLOCK_TAGS.contains(&name.as_str()) && !INLINE_TAGS.contains(&name.as_str()) {
        return None;
    }
    if tag.starts_with("</") {
        return (name != "br").then(|| format!("</{name}>"));
    }
    if name == "a" {
        if let Some(href) = safe_href(tag) {
            return Some(format!("<a href=\"{}\">", escape_text(href)));
        }
    }
    Some(format!("<{name}>"))
}

fn safe_href(tag: &str) -> Option<&str> {
    let caps = HREF.captures(tag)?;
    let value = caps.get(1).or(caps.get(2)).or(caps.get(3))?.as_str().trim();
    let lower = value.to_ascii_lowercase();
    SAFE_HREF_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
        .then_some(value)
}

/// Whether the text already contains a paired block element.
fn is_formatted(text: &str) -> bool {
    let opens: Vec<String> = BLOCK_OPEN
        .captures_iter(text)
        .map(|c| c[1].to_lowercase())
        .collect();
    BLOCK_CLOSE
        .captures_iter(text)
        .any(|c| opens.contains(&c[1].to_lowercase()))
}

/// Split into sentences (terminal `.`/`!`/`?` runs followed by whitespace
/// or end of input) and join every `size` of them into one block.
fn group_sentences(text: &str, size: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek().is_none_or(|n| n.is_whitespace()) {
                let sentence = collapse_whitespace(&current);
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
    }
    let tail = collapse_whitespace(&current);
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
        .chunks(size.max(1))
        .map(|group| group.join(" "))
        .collect()
}

fn render_block(block: &str, allow_headings: bool) -> String {
    if let Some(m) = LIST_MARKER.captures(block) {
        let ordered = m.get(1).is_some();
        let items: String = block
            .lines()
            .map(|line| LIST_MARKER.replace(line, ""))
            .map(|line| render_inline(&collapse_whitespace(&line)))
            .filter(|item| !item.is_empty())
            .map(|item| format!("<li>{item}</li>"))
            .collect();
        let tag = if ordered { "ol" } else { "ul" };
        return format!("<{tag}>{items}</{tag}>");
    }

    let flat = collapse_whitespace(block);
    if let Some(m) = MD_HEADING.find(&flat) {
        let inner = render_inline(&flat[m.end()..]);
        if !inner.is_empty() {
            return format!("<h2>{inner}</h2>");
        }
    }

    let inner = render_inline(&flat);
    if inner.is_empty() {
        return String::new();
    }
    if allow_headings && is_heading(&plain_text(&flat)) {
        format!("<h2>{inner}</h2>")
    } else {
        format!("<p>{inner}</p>")
    }
}

/// Short, capitalized and without a terminal period.
fn is_heading(text: &str) -> bool {
    let len = text.chars().count();
    len > HEADING_MIN_CHARS
        && len < HEADING_MAX_CHARS
        && !text.ends_with('.')
        && text.chars().next().is_some_and(char::is_uppercase)
}

fn plain_text(s: &str) -> String {
    collapse_whitespace(&TAG.replace_all(s, " "))
}

/// Keep allow-listed inline tags, drop other tags, escape the text.
fn render_inline(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in TAG.captures_iter(s) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&escape_text(&s[last..m.start()]));
        if INLINE_TAGS.contains(&caps[1].to_lowercase().as_str()) {
            out.push_str(m.as_str());
        }
        last = m.end();
    }
    out.push_str(&escape_text(&s[last..]));
    out.trim().to_string()
}

/// Escape text while leaving existing character references intact.
fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&escape_html(&rest[..pos]));
        let tail = &rest[pos..];
        match ENTITY.find(tail) {
            Some(m) => {
                out.push_str(m.as_str());
                rest = &tail[m.end()..];
            }
            None => {
                out.push_str("&amp;");
                rest = &tail[1..];
            }
        }
    }
    out.push_str(&escape_html(rest));
    out
}
