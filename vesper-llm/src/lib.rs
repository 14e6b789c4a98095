//! VESPER LLM - Embedding Provider Seam
//!
//! The enrichment worker treats the embedding model as a pure function from
//! text to vector. This crate defines that seam and ships an HTTP provider
//! for Ollama-compatible endpoints.

use async_trait::async_trait;
use vesper_core::{VesperError, VesperResult};

pub mod providers;

pub use providers::OllamaEmbeddingProvider;

// ============================================================================
// EMBEDDING PROVIDER TRAIT
// ============================================================================

/// Produces embedding vectors for text.
///
/// Implementations must be thread-safe. Failures are reported as
/// [`VesperError::Enrichment`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> VesperResult<Vec<f32>>;

    /// Embed several texts, in input order.
    async fn embed_batch(&self, texts: &[&str]) -> VesperResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Model identifier.
    fn model_id(&self) -> &str;
}

pub(crate) fn request_failed(provider: &str, status: u16, message: impl Into<String>) -> VesperError {
    VesperError::enrichment(format!(
        "{} request failed (status {}): {}",
        provider,
        status,
        message.into()
    ))
}

pub(crate) fn invalid_response(provider: &str, message: impl Into<String>) -> VesperError {
    VesperError::enrichment(format!("{} returned an invalid response: {}", provider, message.into()))
}
