//! Embedding provider trait for generating vector embeddings from text.

use async_trait::async_trait;

use crate::error::Result;
use crate::text::content_terms;

/// A provider that generates vector embeddings from text input.
///
/// Implementations must be deterministic: identical input yields an
/// identical vector, otherwise persisted generations and fresh queries would
/// disagree. The default [`embed_batch`](EmbeddingProvider::embed_batch)
/// implementation calls [`embed`](EmbeddingProvider::embed) sequentially;
/// backends that support native batching should override it.
///
/// # Example
///
/// ```rust,ignore
/// use audit_rag::{EmbeddingProvider, HashEmbedder};
///
/// let provider = HashEmbedder::new(256);
/// let embedding = provider.embed("annual scope 1 emissions").await?;
/// assert_eq!(embedding.len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;
}

/// A dependency-free embedder based on feature hashing.
///
/// Each content term is hashed (FNV-1a) into one of `dimensions` buckets with
/// a hash-derived sign; the resulting vector is L2-normalised. Texts sharing
/// vocabulary end up close together, which is enough for offline runs and
/// tests. Text without content terms maps to the zero vector.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in content_terms(text) {
            let hash = fnv1a(term.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn deterministic_and_normalised() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Scope 1 emissions disclosure").await.unwrap();
        let b = embedder.embed("Scope 1 emissions disclosure").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer() {
        let embedder = HashEmbedder::default();
        let query = embedder.embed("greenhouse gas emissions").await.unwrap();
        let related = embedder.embed("total greenhouse gas emissions were reduced").await.unwrap();
        let unrelated = embedder.embed("board diversity policy").await.unwrap();
        assert!(distance(&query, &related) < distance(&query, &unrelated));
    }

    #[tokio::test]
    async fn batch_matches_single() {
        let embedder = HashEmbedder::new(32);
        let batch = embedder.embed_batch(&["water use", ""]).await.unwrap();
        assert_eq!(batch[0], embedder.embed("water use").await.unwrap());
        assert!(batch[1].iter().all(|v| *v == 0.0));
    }
}
