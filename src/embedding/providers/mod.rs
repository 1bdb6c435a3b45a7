//! Embedding provider implementations.
//!
//! `build(kind, config)` is the factory, called when a RAG manager is
//! constructed. Adding a new backend = new module + new match arm.

pub mod http;
pub mod mock;

use std::sync::Arc;

use crate::config::EmbeddingConfig;

use super::{EmbeddingError, EmbeddingProviderKind, EmbeddingService};

/// Construct the provider for `kind`.
pub fn build(
    kind: EmbeddingProviderKind,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingService>, EmbeddingError> {
    match kind {
        EmbeddingProviderKind::Mock => Ok(Arc::new(mock::MockEmbeddingService::new(config.dimension))),
        EmbeddingProviderKind::OpenAi => Ok(Arc::new(http::HttpEmbeddingService::new(
            http::WireFormat::OpenAi,
            config,
        )?)),
        EmbeddingProviderKind::Ollama => Ok(Arc::new(http::HttpEmbeddingService::new(
            http::WireFormat::Ollama,
            config,
        )?)),
    }
}

/// Parse `name` and construct the matching provider.
pub fn build_named(
    name: &str,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingService>, EmbeddingError> {
    build(name.parse()?, config)
}
