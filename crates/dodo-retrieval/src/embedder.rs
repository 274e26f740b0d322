// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Capability trait for text embedding.  Network-backed embedders plug in
/// behind this; the runtime only assumes a fixed dimension and batch calls.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Deterministic local embedder: feature-hashes lowercased alphanumeric
/// terms into a fixed-dimension vector, L2-normalised.
///
/// Not a semantic model; shared terms still produce nonzero cosine overlap,
/// which is enough to make hybrid search functional offline and to keep
/// tests hermetic.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for term in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(term.to_lowercase().as_bytes());
            let bucket = u32::from_le_bytes(digest[..4].try_into().unwrap_or([0; 4])) as usize
                % self.dimension;
            // Second hash byte decides the sign so common terms don't all
            // pile up positive.
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn embedding_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed("fn parse_config()").await.unwrap();
        let b = e.embed("fn parse_config()").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn embedding_has_declared_dimension() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.embed("hello").await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn shared_terms_produce_overlap() {
        let e = HashEmbedder::default();
        let q = e.embed("search").await.unwrap();
        let hit = e.embed("search result").await.unwrap();
        let miss = e.embed("other text").await.unwrap();
        assert!(cosine_similarity(&q, &hit) > cosine_similarity(&q, &miss));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let e = HashEmbedder::default();
        let v = e.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_matches_single() {
        let e = HashEmbedder::default();
        let batch = e
            .embed_batch(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[0], e.embed("one").await.unwrap());
        assert_eq!(batch[1], e.embed("two").await.unwrap());
    }
}
