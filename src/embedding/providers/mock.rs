//! Mock embedding provider: deterministic hash-feature vectors.
//!
//! Terms are hashed into fixed-dimension buckets and weighted by frequency, so
//! texts sharing vocabulary score higher than unrelated ones. A small
//! whole-text component keeps distinct inputs (e.g. differing only in case or
//! punctuation) from mapping to the same vector. No network, no model files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

use crate::embedding::{EmbeddingError, EmbeddingService, is_blank};

/// Weight of each whole-text bucket relative to term features.
const TEXT_SIGNATURE_WEIGHT: f32 = 0.05;
/// Number of buckets the whole-text signature touches.
const TEXT_SIGNATURE_BUCKETS: usize = 4;

#[derive(Debug)]
pub struct MockEmbeddingService {
    dimension: usize,
    connected: AtomicBool,
}

impl MockEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1), connected: AtomicBool::new(false) }
    }

    fn ensure_connected(&self) -> Result<(), EmbeddingError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EmbeddingError::NotConnected(self.name().to_string()))
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];

        let tokens = tokenize(text);
        if !tokens.is_empty() {
            let mut tf: HashMap<&str, f32> = HashMap::new();
            for tok in &tokens {
                *tf.entry(tok.as_str()).or_default() += 1.0;
            }
            let total = tokens.len() as f32;
            for (term, count) in tf {
                // Longer terms are rarer; short ones are mostly stopwords.
                let idf = 1.0 + (term.len() as f32).ln();
                let bucket = bucket_of(&Sha256::digest(term.as_bytes()), 0, self.dimension);
                vec[bucket] += (count / total) * idf;
            }
        }

        let signature = Sha256::digest(text.as_bytes());
        for i in 0..TEXT_SIGNATURE_BUCKETS {
            let bucket = bucket_of(&signature, i * 8, self.dimension);
            vec[bucket] += TEXT_SIGNATURE_WEIGHT;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl EmbeddingService for MockEmbeddingService {
    fn name(&self) -> &str {
        "mock"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn connect(&self) -> Result<(), EmbeddingError> {
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
        Ok(Some(self.embed(text)))
    }

    fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Option<Vec<Option<Vec<f32>>>>, EmbeddingError> {
        self.ensure_connected()?;
        if texts.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            texts
                .iter()
                .map(|t| if is_blank(t) { None } else { Some(self.embed(t)) })
                .collect(),
        ))
    }

    fn test_connection(&self) -> Result<bool, EmbeddingError> {
        Ok(self.connected.load(Ordering::Acquire))
    }
}

/// Lowercase alphanumeric terms of at least two characters.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.chars().count() >= 2)
        .map(|s| s.to_lowercase())
        .collect()
}

/// Map eight digest bytes starting at `offset` onto `0..dims`.
fn bucket_of(digest: &[u8], offset: usize, dims: usize) -> usize {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[offset..offset + 8]);
    (u64::from_le_bytes(bytes) % dims as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::similarity::cosine_similarity;

    fn connected(dim: usize) -> MockEmbeddingService {
        let svc = MockEmbeddingService::new(dim);
        svc.connect().unwrap();
        svc
    }

    #[test]
    fn requires_connection() {
        let svc = MockEmbeddingService::new(16);
        assert!(!svc.test_connection().unwrap());
        assert!(matches!(svc.generate_embedding("x y"), Err(EmbeddingError::NotConnected(_))));
        svc.connect().unwrap();
        assert!(svc.test_connection().unwrap());
        svc.disconnect().unwrap();
        assert!(!svc.test_connection().unwrap());
    }

    #[test]
    fn empty_text_yields_none() {
        let svc = connected(16);
        assert_eq!(svc.generate_embedding("").unwrap(), None);
        assert_eq!(svc.generate_embedding("   ").unwrap(), None);
    }

    #[test]
    fn deterministic_and_fixed_dimension() {
        let svc = connected(64);
        let a = svc.generate_embedding("credential dumping with mimikatz").unwrap().unwrap();
        let b = svc.generate_embedding("credential dumping with mimikatz").unwrap().unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_inputs_differ() {
        let svc = connected(64);
        let a = svc.generate_embedding("Nmap").unwrap().unwrap();
        let b = svc.generate_embedding("nmap").unwrap().unwrap();
        let c = svc.generate_embedding("!!").unwrap().unwrap();
        assert_ne!(a, b);
        assert!(c.iter().any(|x| *x != 0.0));
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let svc = connected(256);
        let q = svc.generate_embedding("credential dumping").unwrap().unwrap();
        let near = svc
            .generate_embedding("Credential dumping obtains account login and password material")
            .unwrap()
            .unwrap();
        let far = svc
            .generate_embedding("Port scanning enumerates listening network services")
            .unwrap()
            .unwrap();
        assert!(
            cosine_similarity(Some(q.as_slice()), Some(near.as_slice()))
                > cosine_similarity(Some(q.as_slice()), Some(far.as_slice()))
        );
    }

    #[test]
    fn batch_preserves_positions_and_empties() {
        let svc = connected(16);
        let out = svc
            .generate_batch_embeddings(&["alpha beta".to_string(), String::new(), "gamma".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_some());
        assert_eq!(svc.generate_batch_embeddings(&[]).unwrap(), None);
    }
}
