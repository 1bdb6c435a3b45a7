//! Application-wide error types.

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::vector_store::VectorStoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EmbeddingError> for AppError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::UnknownProvider(name) => {
                AppError::Config(format!("unknown embedding provider: {name}"))
            }
            other => AppError::Provider(other.to_string()),
        }
    }
}

impl From<VectorStoreError> for AppError {
    fn from(e: VectorStoreError) -> Self {
        match e {
            VectorStoreError::UnknownProvider(name) => {
                AppError::Config(format!("unknown vector store provider: {name}"))
            }
            VectorStoreError::Validation(msg) => AppError::Validation(msg),
            other => AppError::Provider(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("config error"));
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn validation_error_display() {
        let e = AppError::Validation("bad collection name".into());
        assert!(e.to_string().contains("bad collection name"));
    }

    #[test]
    fn unknown_embedding_provider_is_config_error() {
        let e: AppError = EmbeddingError::UnknownProvider("word2vec".into()).into();
        assert!(matches!(e, AppError::Config(_)));
        assert!(e.to_string().contains("word2vec"));
    }

    #[test]
    fn vector_store_validation_maps_through() {
        let e: AppError = VectorStoreError::Validation("empty documents".into()).into();
        assert!(matches!(e, AppError::Validation(_)));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}
