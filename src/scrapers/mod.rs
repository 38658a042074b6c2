//! Inbound content: feeds and article pages.
//!
//! | Module | Input | Output |
//! |--------|-------|--------|
//! | [`feed_parser`] | RSS 2.0 / RDF / Atom XML | [`feed_parser::ParsedFeed`] |
//! | [`feeds`] | catalog ids or a feed URL | [`crate::models::FeedItem`]s with per-feed failures |
//! | [`article`] | article page URL | [`crate::models::ExtractedContent`] |
//!
//! All outbound requests use a browser-like identity and carry an explicit
//! timeout; many publishers reject unidentified clients.

pub mod article;
pub mod feed_parser;
pub mod feeds;
