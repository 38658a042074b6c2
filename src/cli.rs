//! Command-line interface definitions.
//!
//! Credentials can be passed as flags or picked up from the environment, so
//! an external cron can run `news_rewriter trigger <key>` with nothing but
//! exported variables.
//!
//! # Examples
//!
//! ```sh
//! # Serve the invocation API
//! news_rewriter --config news.yaml serve --port 8080
//!
//! # One-shot generation from a theme
//! GROQ_API_KEY=... news_rewriter generate --theme "Harga beras naik" --style Formal
//!
//! # Run a scheduled job by its trigger key
//! news_rewriter trigger 9f3kq0c1ab7x2mzd
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::models::{Language, NewsModel, NewsStyle};
use crate::rewriter::WritingOptions;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// API key of the generative-text backend (falls back to TEXT_API_KEY)
    #[arg(long, env = "GROQ_API_KEY", global = true, hide_env_values = true)]
    pub text_api_key: Option<String>,

    /// API token of the generative-image backend
    #[arg(long, env = "REPLICATE_API_TOKEN", global = true, hide_env_values = true)]
    pub image_api_token: Option<String>,

    /// Asset host cloud name
    #[arg(long, env = "CLOUDINARY_CLOUD_NAME", global = true)]
    pub cloudinary_cloud_name: Option<String>,

    /// Asset host unsigned upload preset
    #[arg(long, env = "CLOUDINARY_UPLOAD_PRESET", global = true)]
    pub cloudinary_upload_preset: Option<String>,

    /// JSON file holding articles, categories and jobs
    #[arg(long, env = "NEWS_STORE_PATH", global = true)]
    pub store_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP invocation surface
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },

    /// Fetch configured feeds (all when none are named)
    Feeds {
        /// Feed ids from the catalog
        #[arg(short, long, value_delimiter = ',')]
        feeds: Vec<String>,
        /// Fetch an arbitrary feed URL instead of the catalog
        #[arg(long, conflicts_with = "feeds")]
        url: Option<String>,
    },

    /// Extract the main text of one article page
    Extract { url: String },

    /// Run the full pipeline for one article URL
    Import {
        url: String,
        #[arg(long, default_value = "RSS Feed")]
        source_name: String,
        #[command(flatten)]
        options: GenerationArgs,
        /// Append the source attribution block
        #[arg(long)]
        attribution: bool,
    },

    /// Write a new article from a theme
    Generate {
        #[arg(short, long)]
        theme: String,
        #[command(flatten)]
        options: GenerationArgs,
    },

    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Run a job by its trigger key
    Trigger { key: String },
}

#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long, value_parser = parse_style, default_value = "Formal")]
    pub style: NewsStyle,
    #[arg(long, value_parser = parse_model, default_value = "Breaking News")]
    pub model: NewsModel,
    #[arg(long, value_parser = parse_language, default_value = "id")]
    pub language: Language,
    /// Synthesize a cover image when the image backend is configured
    #[arg(long)]
    pub image: bool,
    /// Publish immediately instead of saving a draft
    #[arg(long)]
    pub publish: bool,
}

impl GenerationArgs {
    pub fn writing_options(&self) -> WritingOptions {
        WritingOptions {
            style: self.style,
            model: self.model,
            language: self.language,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum JobAction {
    /// Create a job and print its trigger URL
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        theme: String,
        /// Catalog feed ids; makes this a feed-sourced job
        #[arg(long, value_delimiter = ',')]
        feeds: Vec<String>,
        #[arg(long)]
        feed_url: Option<String>,
        #[arg(long, default_value_t = 1)]
        articles_per_run: u32,
        #[arg(long)]
        attribution: bool,
        #[command(flatten)]
        options: GenerationArgs,
    },
    /// List all jobs
    List,
    /// Resume a job
    Enable { id: String },
    /// Suspend a job without deleting its history
    Disable { id: String },
}

fn parse_style(s: &str) -> Result<NewsStyle, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown style '{s}'"))
}

fn parse_model(s: &str) -> Result<NewsModel, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown article model '{s}'"))
}

fn parse_language(s: &str) -> Result<Language, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unsupported language '{s}'"))
}
