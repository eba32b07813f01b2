//! Remote embedding provider.
//!
//! Calls an OpenAI-compatible `/embeddings` endpoint with bearer
//! authentication. Works with hosted embedding APIs that accept text and
//! base64-encoded image inputs.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use super::traits::{Embedding, EmbeddingProvider, ProviderError, ProviderResult};
use crate::config::RetrySettings;

/// Embedding API request format.
#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: &'static str,
}

/// Embedding API response format.
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding API error response.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Provider backed by a hosted embedding API.
pub struct RemoteProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetrySettings,
}

impl RemoteProvider {
    /// Creates a provider for the given endpoint and credentials.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        retry: RetrySettings,
    ) -> ProviderResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| ProviderError::InvalidInput(format!("invalid base URL: {}", e)))?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
            model: model.into(),
            retry,
        })
    }

    /// Overrides the HTTP client (useful for custom timeouts or proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn build_request(&self, input: String) -> EmbeddingRequest {
        EmbeddingRequest {
            model: self.model.clone(),
            input: vec![input],
            encoding_format: "float",
        }
    }

    async fn handle_error_response(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return ProviderError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        if let Ok(error) = response.json::<ApiErrorResponse>().await {
            return ProviderError::Api {
                status,
                message: error.error.message,
            };
        }

        ProviderError::Api {
            status,
            message: format!("HTTP {}", status),
        }
    }

    /// Whether a failure is worth another attempt.
    fn is_retryable(error: &ProviderError) -> bool {
        match error {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    async fn post_once(&self, input: String) -> ProviderResult<Embedding> {
        let url = format!("{}/embeddings", self.base_url);
        let body = self.build_request(input);

        let response = self
            .client
            .post(&url)
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::handle_error_response(response).await);
        }

        let api_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {}", e)))?;

        let data = api_response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no embeddings in response".to_string()))?;

        if data.embedding.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "empty embedding vector".to_string(),
            ));
        }

        Ok(Embedding::new(data.embedding))
    }

    /// Posts with bounded exponential backoff on transient failures.
    async fn post_with_retry(&self, input: String) -> ProviderResult<Embedding> {
        let attempts = self.retry.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.retry.base_delay_ms);

        for attempt in 1..=attempts {
            match self.post_once(input.clone()).await {
                Ok(embedding) => return Ok(embedding),
                Err(error) if attempt < attempts && Self::is_retryable(&error) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %error,
                        "transient embedding API failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error),
            }
        }

        unreachable!("retry loop always returns")
    }

    fn image_data_url(path: &Path) -> ProviderResult<String> {
        let bytes = std::fs::read(path)
            .map_err(|e| ProviderError::InvalidInput(format!("cannot read {:?}: {}", path, e)))?;
        let mime = match path.extension().and_then(|ext| ext.to_str()) {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{}", mime, encoded))
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_text(&self, text: &str) -> ProviderResult<Embedding> {
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty query".to_string()));
        }
        self.post_with_retry(text.to_string()).await
    }

    async fn embed_image(&self, path: &Path) -> ProviderResult<Embedding> {
        let data_url = Self::image_data_url(path)?;
        self.post_with_retry(data_url).await
    }
}
