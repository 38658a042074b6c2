//! Runtime configuration.
//!
//! A [`Config`] is loaded once from an optional YAML file, patched with
//! CLI/environment overrides and then handed to each component constructor.
//! Components never read the environment themselves, so tests can build them
//! with fake endpoints and credentials.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

use crate::cli::Cli;

/// Provider-neutral fallback for the text backend credential.
pub const TEXT_API_KEY_ENV: &str = "TEXT_API_KEY";

/// Browser identity; many news feeds reject unidentified clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub feeds: Vec<FeedSource>,
    pub text: TextConfig,
    pub image: ImageConfig,
    pub assets: AssetConfig,
    pub extract: ExtractConfig,
    pub store: StoreConfig,
    pub default_category: DefaultCategory,
    pub site_url: SiteUrl,
}

/// A named feed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub country: String,
}

impl FeedSource {
    fn new(id: &str, name: &str, url: &str, category: &str, country: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            category: category.to_string(),
            country: country.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub feed_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub text_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            accept_language: "id-ID,id;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            feed_timeout_secs: 15,
            page_timeout_secs: 15,
            text_timeout_secs: 90,
            image_timeout_secs: 60,
            upload_timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

/// OpenAI-compatible chat-completions backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Source text beyond this many characters is not sent.
    pub max_content_chars: usize,
    /// Extra attempts after the first; zero means a single attempt.
    pub max_retries: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            model: "llama-3.3-70b-versatile".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
            max_content_chars: 12_000,
            max_retries: 0,
        }
    }
}

/// Replicate-style prediction backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub model: String,
    pub aspect_ratio: String,
    pub output_format: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.replicate.com/v1".to_string(),
            api_token: None,
            model: "black-forest-labs/flux-schnell".to_string(),
            aspect_ratio: "16:9".to_string(),
            output_format: "webp".to_string(),
        }
    }
}

/// Unsigned-upload asset host (Cloudinary-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub endpoint: String,
    pub cloud_name: Option<String>,
    pub upload_preset: Option<String>,
    pub folder: String,
    /// Source images above this size are not relocated.
    pub max_image_bytes: usize,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.cloudinary.com/v1_1".to_string(),
            cloud_name: None,
            upload_preset: None,
            folder: "rss-articles".to_string(),
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub max_chars: usize,
    pub min_paragraph_chars: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_chars: 15_000,
            min_paragraph_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultCategory(pub String);

impl Default for DefaultCategory {
    fn default() -> Self {
        DefaultCategory("Umum".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteUrl(pub String);

impl Default for SiteUrl {
    fn default() -> Self {
        SiteUrl("http://localhost:3000".to_string())
    }
}

impl Config {
    /// Load from a YAML file, or defaults when no path is given.
    #[instrument(level = "info", skip_all)]
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let config: Config = serde_yaml::from_str(&raw)?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => Config::default(),
        };
        if config.feeds.is_empty() {
            config.feeds = default_feeds();
        }
        Ok(config)
    }

    /// Apply CLI flags / environment variables over the file values.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        self.apply_overrides_from(cli, |name| std::env::var(name).ok());
    }

    /// `--text-api-key`/`GROQ_API_KEY` win over `TEXT_API_KEY`, which wins
    /// over the file.
    fn apply_overrides_from(&mut self, cli: &Cli, env: impl Fn(&str) -> Option<String>) {
        let text_key = cli
            .text_api_key
            .clone()
            .or_else(|| env(TEXT_API_KEY_ENV))
            .filter(|k| !k.trim().is_empty());
        if let Some(key) = text_key {
            self.text.api_key = Some(key);
        }
        if let Some(token) = &cli.image_api_token {
            self.image.api_token = Some(token.clone());
        }
        if let Some(name) = &cli.cloudinary_cloud_name {
            self.assets.cloud_name = Some(name.clone());
        }
        if let Some(preset) = &cli.cloudinary_upload_preset {
            self.assets.upload_preset = Some(preset.clone());
        }
        if let Some(path) = &cli.store_path {
            self.store.path = Some(path.clone());
        }
    }

    /// Public URL an external scheduler hits to run a job.
    pub fn trigger_url(&self, trigger_key: &str) -> String {
        format!(
            "{}/api/cron/{}",
            self.site_url.0.trim_end_matches('/'),
            trigger_key
        )
    }
}

/// Built-in catalog used when the configuration lists no feeds.
pub fn default_feeds() -> Vec<FeedSource> {
    vec![
        FeedSource::new("cnn-indonesia", "CNN Indonesia - All", "https://www.cnnindonesia.com/rss", "Berita Nasional", "Indonesia"),
        FeedSource::new("tempo-terkini", "Tempo - Terkini", "https://rss.tempo.co/terkini", "Berita Terkini", "Indonesia"),
        FeedSource::new("tempo-nasional", "Tempo - Nasional", "https://rss.tempo.co/nasional", "Berita Nasional", "Indonesia"),
        FeedSource::new("tempo-bisnis", "Tempo - Bisnis", "https://rss.tempo.co/bisnis", "Bisnis", "Indonesia"),
        FeedSource::new("kompas-all", "Kompas - All", "https://www.kompas.com/rss/", "Berita Terkini", "Indonesia"),
        FeedSource::new("kompas-tekno", "Kompas - Tekno", "https://rss.kompas.com/tekno", "Teknologi", "Indonesia"),
        FeedSource::new("detik-all", "Detik - All", "https://rss.detik.com/index.php/detikcom", "Berita Terkini", "Indonesia"),
        FeedSource::new("detik-finance", "Detik - Finance", "https://rss.detik.com/index.php/detikfinance", "Bisnis", "Indonesia"),
        FeedSource::new("liputan6-news", "Liputan6 - News", "https://www.liputan6.com/news/rss", "Berita Nasional", "Indonesia"),
        FeedSource::new("antara-terkini", "Antara - Terkini", "https://www.antaranews.com/rss/terkini.xml", "Berita Terkini", "Indonesia"),
        FeedSource::new("tribun-all", "Tribun News - All", "https://www.tribunnews.com/rss", "Berita Terkini", "Indonesia"),
        FeedSource::new("bbc-indonesia", "BBC Indonesia", "https://feeds.bbci.co.uk/indonesia/rss.xml", "Berita Internasional", "International"),
        FeedSource::new("aljazeera", "Al Jazeera", "https://www.aljazeera.com/xml/rss/all.xml", "Berita Internasional", "International"),
    ]
}
