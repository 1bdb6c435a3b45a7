//! Embedding service abstraction.
//!
//! [`EmbeddingService`] is the capability set every provider implements:
//! connect / disconnect, single and batch embedding, and a connection check.
//! Every method has a default body that reports [`EmbeddingError::NotImplemented`],
//! so a provider only overrides what it supports and callers never need to
//! know which concrete backend they hold.
//!
//! Providers are selected by [`EmbeddingProviderKind`], parsed from the
//! configured identifier, and constructed by [`providers::build`].
//!
//! Implementations must be safe to call from many threads at once. They hold
//! only fixed configuration plus a connected flag; no per-call state is shared.

pub mod providers;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),
    #[error("{0} is not implemented by this provider")]
    NotImplemented(&'static str),
    #[error("embedding service '{0}' is not connected")]
    NotConnected(String),
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

// ── Provider identifiers ─────────────────────────────────────────────────────

/// Known embedding providers. Anything else is rejected at the factory boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingProviderKind {
    /// Deterministic hash-feature vectors; offline.
    Mock,
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    OpenAi,
    /// Ollama `/api/embeddings` endpoint.
    Ollama,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProviderKind::Mock => "mock",
            EmbeddingProviderKind::OpenAi => "openai",
            EmbeddingProviderKind::Ollama => "ollama",
        }
    }
}

impl FromStr for EmbeddingProviderKind {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(EmbeddingProviderKind::Mock),
            "openai" | "openai-compatible" => Ok(EmbeddingProviderKind::OpenAi),
            "ollama" => Ok(EmbeddingProviderKind::Ollama),
            _ => Err(EmbeddingError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capability set ───────────────────────────────────────────────────────────

/// Text → fixed-dimension vector.
///
/// `generate_embedding` returns `Ok(None)` for empty text. For any other input
/// it must be deterministic: identical text yields an identical vector.
pub trait EmbeddingService: Send + Sync + fmt::Debug {
    /// Provider identifier, used in logs.
    fn name(&self) -> &str;

    /// Dimension of every vector this instance produces.
    fn dimension(&self) -> usize;

    fn connect(&self) -> Result<(), EmbeddingError> {
        Err(EmbeddingError::NotImplemented("connect"))
    }

    fn disconnect(&self) -> Result<(), EmbeddingError> {
        Err(EmbeddingError::NotImplemented("disconnect"))
    }

    fn generate_embedding(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::NotImplemented("generate_embedding"))
    }

    /// One entry per input text (`None` for empty strings), or `Ok(None)` for
    /// an empty batch.
    fn generate_batch_embeddings(
        &self,
        _texts: &[String],
    ) -> Result<Option<Vec<Option<Vec<f32>>>>, EmbeddingError> {
        Err(EmbeddingError::NotImplemented("generate_batch_embeddings"))
    }

    /// Reflects the connected/disconnected state only.
    fn test_connection(&self) -> Result<bool, EmbeddingError> {
        Err(EmbeddingError::NotImplemented("test_connection"))
    }
}

/// `true` for text that should not be embedded.
pub(crate) fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Bare;

    impl EmbeddingService for Bare {
        fn name(&self) -> &str {
            "bare"
        }
        fn dimension(&self) -> usize {
            4
        }
    }

    #[test]
    fn base_trait_reports_not_implemented_everywhere() {
        let svc = Bare;
        assert!(matches!(svc.connect(), Err(EmbeddingError::NotImplemented("connect"))));
        assert!(matches!(svc.disconnect(), Err(EmbeddingError::NotImplemented(_))));
        assert!(matches!(svc.generate_embedding("x"), Err(EmbeddingError::NotImplemented(_))));
        assert!(matches!(
            svc.generate_batch_embeddings(&["x".to_string()]),
            Err(EmbeddingError::NotImplemented(_))
        ));
        assert!(matches!(svc.test_connection(), Err(EmbeddingError::NotImplemented(_))));
    }

    #[test]
    fn provider_kind_parses_known_identifiers() {
        assert_eq!("mock".parse::<EmbeddingProviderKind>().unwrap(), EmbeddingProviderKind::Mock);
        assert_eq!("OpenAI".parse::<EmbeddingProviderKind>().unwrap(), EmbeddingProviderKind::OpenAi);
        assert_eq!(
            "openai-compatible".parse::<EmbeddingProviderKind>().unwrap(),
            EmbeddingProviderKind::OpenAi
        );
        assert_eq!("ollama".parse::<EmbeddingProviderKind>().unwrap(), EmbeddingProviderKind::Ollama);
    }

    #[test]
    fn provider_kind_rejects_unknown() {
        let err = "word2vec".parse::<EmbeddingProviderKind>().unwrap_err();
        assert!(matches!(err, EmbeddingError::UnknownProvider(ref n) if n == "word2vec"));
    }
}
