//! Embedding provider implementations

pub mod ollama;

pub use ollama::OllamaEmbeddingProvider;
