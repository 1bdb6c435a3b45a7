//! HTTP embedding providers (OpenAI-compatible and Ollama).
//!
//! Both wire formats share one client type; only the request/response bodies
//! differ. Wire types are private to this module. Every request carries the
//! configured timeout, so a stalled backend surfaces as an error that the RAG
//! layer turns into "no context".

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingError, EmbeddingService, is_blank};

/// Request/response shape spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST {model, input: [..]}` → `{data: [{embedding}]}`.
    OpenAi,
    /// `POST {model, prompt}` → `{embedding}`; one text per request.
    Ollama,
}

#[derive(Debug)]
pub struct HttpEmbeddingService {
    client: Client,
    format: WireFormat,
    api_base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
    connected: AtomicBool,
}

impl HttpEmbeddingService {
    pub fn new(format: WireFormat, config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EmbeddingError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            format,
            api_base_url: config.api_base_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            api_key: config.api_key.clone(),
            connected: AtomicBool::new(false),
        })
    }

    fn ensure_connected(&self) -> Result<(), EmbeddingError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EmbeddingError::NotConnected(self.name().to_string()))
        }
    }

    fn post<T: Serialize, R: for<'de> Deserialize<'de>>(&self, body: &T) -> Result<R, EmbeddingError> {
        let mut req = self.client.post(&self.api_base_url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().map_err(|e| {
            warn!(url = %self.api_base_url, timeout = e.is_timeout(), error = %e, "embedding request failed");
            EmbeddingError::Request(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::Request(format!("HTTP {status}: {body}")));
        }
        response
            .json::<R>()
            .map_err(|e| EmbeddingError::Request(format!("invalid embedding response: {e}")))
    }

    fn check_dimension(&self, v: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        if v.len() != self.dimension {
            return Err(EmbeddingError::Dimension { expected: self.dimension, actual: v.len() });
        }
        Ok(v)
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!(provider = self.name(), model = %self.model, text_len = text.len(), "embedding request");
        let v = match self.format {
            WireFormat::OpenAi => {
                let body = OpenAiRequest { model: &self.model, input: vec![text] };
                let resp: OpenAiResponse = self.post(&body)?;
                resp.data
                    .into_iter()
                    .next()
                    .map(|d| d.embedding)
                    .ok_or_else(|| EmbeddingError::Request("empty embedding response".into()))?
            }
            WireFormat::Ollama => {
                let body = OllamaRequest { model: &self.model, prompt: text };
                let resp: OllamaResponse = self.post(&body)?;
                resp.embedding
            }
        };
        self.check_dimension(v)
    }

    fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        match self.format {
            WireFormat::OpenAi => {
                let body = OpenAiRequest { model: &self.model, input: texts.to_vec() };
                let resp: OpenAiResponse = self.post(&body)?;
                if resp.data.len() != texts.len() {
                    return Err(EmbeddingError::Request(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        resp.data.len()
                    )));
                }
                let mut data = resp.data;
                data.sort_by_key(|d| d.index);
                data.into_iter().map(|d| self.check_dimension(d.embedding)).collect()
            }
            WireFormat::Ollama => texts.iter().map(|t| self.embed_one(t)).collect(),
        }
    }
}

impl EmbeddingService for HttpEmbeddingService {
    fn name(&self) -> &str {
        match self.format {
            WireFormat::OpenAi => "openai",
            WireFormat::Ollama => "ollama",
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn connect(&self) -> Result<(), EmbeddingError> {
        if self.api_base_url.trim().is_empty() {
            return Err(EmbeddingError::Request("api_base_url is empty".into()));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), EmbeddingError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn generate_embedding(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.ensure_connected()?;
        if is_blank(text) {
            return Ok(None);
        }
        self.embed_one(text).map(Some)
    }

    fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Option<Vec<Option<Vec<f32>>>>, EmbeddingError> {
        self.ensure_connected()?;
        if texts.is_empty() {
            return Ok(None);
        }
        let non_blank: Vec<&str> = texts.iter().map(String::as_str).filter(|t| !is_blank(t)).collect();
        let mut embedded = if non_blank.is_empty() {
            Vec::new().into_iter()
        } else {
            self.embed_many(&non_blank)?.into_iter()
        };
        Ok(Some(
            texts
                .iter()
                .map(|t| if is_blank(t) { None } else { embedded.next() })
                .collect(),
        ))
    }

    fn test_connection(&self) -> Result<bool, EmbeddingError> {
        Ok(self.connected.load(Ordering::Acquire))
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}
