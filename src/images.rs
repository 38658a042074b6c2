//! Cover images: synthesis and relocation.
//!
//! Generation is optional and gated twice, by the caller's flag and by the
//! presence of an image-backend token. Relocation re-hosts a source image
//! on the asset host and falls back to the original URL on any failure.
//! Neither sub-stage can fail article creation.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{AssetConfig, HttpConfig, ImageConfig};
use crate::error::{BackendError, PipelineError};
use crate::models::{CoverImage, ImageOrigin};
use crate::utils::truncate_for_log;

/// Prompt in, image URL out.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;
}

/// Re-hosts a remote image and returns its permanent URL.
#[async_trait]
pub trait AssetHost: Send + Sync {
    async fn upload(&self, source_url: &str) -> Result<String, BackendError>;
}

/// Outcome of an optional capability.
///
/// `Unavailable` is the expected skip (not requested, or not configured);
/// `Failed` means the capability was available and tried.
#[derive(Debug)]
pub enum Capability<T> {
    Unavailable,
    Failed(PipelineError),
    Succeeded(T),
}

impl<T> Capability<T> {
    pub fn succeeded(self) -> Option<T> {
        match self {
            Capability::Succeeded(v) => Some(v),
            _ => None,
        }
    }
}

/// Replicate-style predictions API (`Prefer: wait`, synchronous answer).
pub struct ReplicateClient {
    client: Client,
    endpoint: String,
    token: String,
    model: String,
    aspect_ratio: String,
    output_format: String,
}

#[derive(Deserialize)]
struct Prediction {
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<Value>,
}

impl ReplicateClient {
    pub fn new(config: &ImageConfig, token: String, http: &HttpConfig) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.image_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token,
            model: config.model.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            output_format: config.output_format.clone(),
        })
    }
}

#[async_trait]
impl ImageBackend for ReplicateClient {
    #[instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(format!("{}/models/{}/predictions", self.endpoint, self.model))
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header("Prefer", "wait")
            .json(&json!({
                "input": {
                    "prompt": prompt,
                    "aspect_ratio": self.aspect_ratio,
                    "output_format": self.output_format,
                    "go_fast": true,
                    "megapixels": "1",
                    "num_outputs": 1,
                    "output_quality": 90
                }
            }))
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(BackendError::from_reqwest)?;
        if !status.is_success() {
            return Err(BackendError::Rejected(format!(
                "HTTP {status}: {}",
                truncate_for_log(&body, 200)
            )));
        }

        let prediction: Prediction = serde_json::from_str(&body)
            .map_err(|e| BackendError::Rejected(format!("malformed prediction: {e}")))?;
        debug!(status = %prediction.status, "Prediction returned");

        match prediction.status.as_str() {
            "succeeded" => first_url(&prediction.output)
                .ok_or_else(|| BackendError::Rejected("prediction has no output".to_string())),
            "starting" | "processing" => Err(BackendError::Unavailable(format!(
                "prediction still {} after wait",
                prediction.status
            ))),
            other => Err(BackendError::Rejected(format!(
                "prediction {other}: {}",
                prediction.error.map(|e| e.to_string()).unwrap_or_default()
            ))),
        }
    }
}

fn first_url(output: &Value) -> Option<String> {
    match output {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Cloudinary-compatible unsigned upload (cloud name + upload preset only).
pub struct CloudinaryHost {
    client: Client,
    upload_url: String,
    upload_preset: String,
    folder: String,
    max_bytes: usize,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
}

impl CloudinaryHost {
    pub fn new(
        config: &AssetConfig,
        cloud_name: &str,
        upload_preset: String,
        http: &HttpConfig,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(&http.user_agent)
            .timeout(Duration::from_secs(http.upload_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            upload_url: format!(
                "{}/{}/image/upload",
                config.endpoint.trim_end_matches('/'),
                cloud_name
            ),
            upload_preset,
            folder: config.folder.clone(),
            max_bytes: config.max_image_bytes,
        })
    }

    /// Read the source image body, refusing anything over `max_bytes`.
    async fn read_capped(&self, mut download: reqwest::Response) -> Result<Vec<u8>, BackendError> {
        let too_large = |size: usize| {
            BackendError::Rejected(format!(
                "source image exceeds {} bytes (got at least {size})",
                self.max_bytes
            ))
        };
        if let Some(declared) = download.content_length() {
            let declared = usize::try_from(declared).unwrap_or(usize::MAX);
            if declared > self.max_bytes {
                return Err(too_large(declared));
            }
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = download.chunk().await.map_err(BackendError::from_reqwest)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(too_large(bytes.len() + chunk.len()));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl AssetHost for CloudinaryHost {
    #[instrument(level = "info", skip_all, fields(source = %truncate_for_log(source_url, 80)))]
    async fn upload(&self, source_url: &str) -> Result<String, BackendError> {
        let download = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;
        if !download.status().is_success() {
            return Err(BackendError::Rejected(format!(
                "source image answered HTTP {}",
                download.status()
            )));
        }
        let mime = download
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = self.read_capped(download).await?;
        if bytes.is_empty() {
            return Err(BackendError::Rejected("source image is empty".to_string()));
        }

        let part = Part::bytes(bytes)
            .file_name("image")
            .mime_str(&mime)
            .map_err(|e| BackendError::Rejected(format!("invalid content type: {e}")))?;
        let form = Form::new()
            .part("file", part)
            .text("upload_preset", self.upload_preset.clone())
            .text("folder", self.folder.clone());

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(BackendError::from_reqwest)?;
        if !status.is_success() {
            return Err(BackendError::Rejected(format!(
                "asset host HTTP {status}: {}",
                truncate_for_log(&body, 200)
            )));
        }

        let uploaded: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::Rejected(format!("malformed upload response: {e}")))?;
        uploaded
            .secure_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BackendError::Rejected("upload response has no secure_url".to_string()))
    }
}

/// Generation plus relocation behind one entry point.
#[derive(Clone, Default)]
pub struct ImagePipeline {
    generator: Option<Arc<dyn ImageBackend>>,
    host: Option<Arc<dyn AssetHost>>,
}

impl ImagePipeline {
    pub fn new(generator: Option<Arc<dyn ImageBackend>>, host: Option<Arc<dyn AssetHost>>) -> Self {
        Self { generator, host }
    }

    /// Wire up whichever backends have credentials.
    pub fn from_config(
        image: &ImageConfig,
        assets: &AssetConfig,
        http: &HttpConfig,
    ) -> Result<Self, PipelineError> {
        let generator: Option<Arc<dyn ImageBackend>> = match image.api_token.as_deref() {
            Some(token) if !token.trim().is_empty() => {
                Some(Arc::new(ReplicateClient::new(image, token.to_string(), http)?))
            }
            _ => None,
        };
        let host: Option<Arc<dyn AssetHost>> =
            match (assets.cloud_name.as_deref(), assets.upload_preset.as_deref()) {
                (Some(cloud), Some(preset)) if !cloud.is_empty() && !preset.is_empty() => Some(
                    Arc::new(CloudinaryHost::new(assets, cloud, preset.to_string(), http)?),
                ),
                _ => None,
            };
        info!(
            generation = generator.is_some(),
            relocation = host.is_some(),
            "Image capabilities"
        );
        Ok(Self { generator, host })
    }

    pub fn can_generate(&self) -> bool {
        self.generator.is_some()
    }

    /// Synthesize an image. `prompt` is only awaited when generation is
    /// both requested and configured.
    pub async fn generate<F, Fut>(&self, requested: bool, prompt: F) -> Capability<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        let Some(generator) = self.generator.as_ref().filter(|_| requested) else {
            debug!(requested, "Image generation skipped");
            return Capability::Unavailable;
        };

        let prompt = prompt().await;
        match generator.generate(&prompt).await {
            Ok(url) => {
                // Generated URLs expire; keep the ephemeral one if re-hosting fails.
                let durable = self.relocate(&url).await.url.unwrap_or(url);
                info!(url = %durable, "Cover image generated");
                Capability::Succeeded(durable)
            }
            Err(e) => {
                warn!(error = %e, "Image generation failed; continuing without it");
                Capability::Failed(e.into())
            }
        }
    }

    /// Re-host `source_url`, falling back to it unchanged.
    pub async fn relocate(&self, source_url: &str) -> CoverImage {
        let Some(host) = self.host.as_ref() else {
            return CoverImage::new(source_url.to_string(), ImageOrigin::Original);
        };
        match host.upload(source_url).await {
            Ok(url) => CoverImage::new(url, ImageOrigin::Uploaded),
            Err(e) => {
                warn!(error = %e, %source_url, "Image relocation failed; keeping original URL");
                CoverImage::new(source_url.to_string(), ImageOrigin::Original)
            }
        }
    }

    /// Run generation and source-image relocation concurrently and pick
    /// the cover: generated first, then the source image, else none.
    #[instrument(level = "info", skip_all, fields(requested = requested, has_source = source_image.is_some()))]
    pub async fn cover_image<F, Fut>(
        &self,
        requested: bool,
        prompt: F,
        source_image: Option<&str>,
    ) -> CoverImage
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        let relocation = async {
            match source_image {
                Some(url) if !url.trim().is_empty() => Some(self.relocate(url.trim()).await),
                _ => None,
            }
        };
        let (generated, relocated) = tokio::join!(self.generate(requested, prompt), relocation);

        match (generated.succeeded(), relocated) {
            (Some(url), _) => CoverImage::new(url, ImageOrigin::Generated),
            (None, Some(source)) => source,
            (None, None) => CoverImage::none(),
        }
    }
}
