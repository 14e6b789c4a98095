//! Ollama embedding provider

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;
use vesper_core::{EmbeddingConfig, VesperResult};

use super::types::{EmbeddingRequest, EmbeddingResponse, ListModelsResponse};
use crate::{invalid_response, request_failed, EmbeddingProvider};

const PROVIDER: &str = "ollama";

/// Embedding provider backed by an Ollama server.
pub struct OllamaEmbeddingProvider {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbeddingProvider {
    /// # Arguments
    /// * `base_url` - Ollama server URL (e.g., "http://localhost:11434")
    /// * `model` - Model name (e.g., "nomic-embed-text")
    /// * `dimensions` - Embedding dimensions for the model
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(&config.base_url, &config.model, config.dimensions)
    }

    /// Check if the model is available on the server.
    pub async fn check_model_available(&self) -> VesperResult<bool> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            request_failed(PROVIDER, 0, format!("Failed to connect to Ollama: {}", e))
        })?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let list: ListModelsResponse = response.json().await.map_err(|e| {
            invalid_response(PROVIDER, format!("Failed to parse models list: {}", e))
        })?;

        Ok(list.models.iter().any(|m| m.name.contains(&self.model)))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> VesperResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_failed(PROVIDER, 0, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(request_failed(PROVIDER, status.as_u16(), error_text));
        }

        let body: EmbeddingResponse = response.json().await.map_err(|e| {
            invalid_response(PROVIDER, format!("Failed to parse response: {}", e))
        })?;

        if body.embedding.len() != self.dimensions && !body.embedding.is_empty() {
            warn!(
                model = %self.model,
                expected = self.dimensions,
                actual = body.embedding.len(),
                "Embedding dimensions differ from configuration"
            );
        }
        Ok(body.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for OllamaEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEmbeddingProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::VesperError;

    #[test]
    fn test_from_config_trims_trailing_slash() {
        let config = EmbeddingConfig {
            base_url: "http://localhost:11434/".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
        };
        let provider = OllamaEmbeddingProvider::from_config(&config);
        assert_eq!(provider.dimensions(), 768);
        assert_eq!(provider.model_id(), "nomic-embed-text");
        assert!(format!("{:?}", provider).contains("http://localhost:11434\""));
    }

    #[test]
    fn test_request_serialization() {
        let request = EmbeddingRequest {
            model: "m".to_string(),
            prompt: "hello".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({"model": "m", "prompt": "hello"}));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_enrichment_error() {
        let provider = OllamaEmbeddingProvider::new("http://127.0.0.1:1", "m", 3);
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, VesperError::Enrichment { .. }));
    }
}
