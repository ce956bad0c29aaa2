//! Client for the hosted text- and image-generation services.
//!
//! Both services take `POST { inputs, options? }` with a bearer service token.
//! The text service answers `[ { "generated_text": ... } ]`, the image service
//! answers with raw image bytes. Failures come back as `{ "error": ... }`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ModelsConfig;
use crate::error::GenerationError;

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<InferenceOptions>,
}

#[derive(Debug, Serialize)]
struct InferenceOptions {
    use_cache: bool,
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    error: String,
}

/// Raw image payload returned by the image service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl InferenceClient {
    pub fn new(config: &ModelsConfig) -> anyhow::Result<Self> {
        let token = config.resolve_token();
        if token.is_none() {
            warn!(
                "[inference] No service token configured (models.token / ${}); requests will be anonymous",
                config.token_env
            );
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, token })
    }

    /// One fresh sample from the text model. The service cache is always
    /// bypassed so repeated prompts are not replayed.
    pub async fn generate_text(&self, url: &str, prompt: &str) -> Result<String, GenerationError> {
        let request = InferenceRequest {
            inputs: prompt,
            options: Some(InferenceOptions { use_cache: false }),
        };
        let response = self.post(url, &request).await?;

        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        let mut generations: Vec<GeneratedText> = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Decode(format!("unexpected text response: {}", e)))?;
        if generations.is_empty() {
            return Err(GenerationError::Decode("text response held no generations".into()));
        }
        Ok(generations.swap_remove(0).generated_text)
    }

    pub async fn generate_image(
        &self,
        url: &str,
        prompt: &str,
    ) -> Result<ImageBytes, GenerationError> {
        let request = InferenceRequest {
            inputs: prompt,
            options: None,
        };
        let response = self.post(url, &request).await?;

        let declared = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
        let data = response
            .bytes()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        if data.is_empty() {
            return Err(GenerationError::Decode("image response was empty".into()));
        }

        let content_type = match declared {
            Some(ct) if ct.starts_with("image/") => ct,
            _ => sniff_image_type(&data)
                .map(str::to_string)
                .ok_or_else(|| GenerationError::Decode("response is not an image".into()))?,
        };

        Ok(ImageBytes { data, content_type })
    }

    async fn post(
        &self,
        url: &str,
        request: &InferenceRequest<'_>,
    ) -> Result<reqwest::Response, GenerationError> {
        debug!("[inference] POST {}", url);
        let mut builder = self.client.post(url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ServiceError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        Err(GenerationError::Transport(format!(
            "service returned {}: {}",
            status,
            detail.trim()
        )))
    }
}

/// MIME type of `data` when its magic bytes identify an image format.
pub fn sniff_image_type(data: &[u8]) -> Option<&'static str> {
    infer::get(data)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
}
