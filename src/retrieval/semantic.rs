//! Nearest-neighbour index over chunk embeddings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KlerResult;

use super::tokenizer::tokenize;

/// Distance used to order neighbours, smaller is closer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(p, q)| {
                    let d = (*p - *q) as f64;
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
        }
    }
}

/// `1 - cosine similarity`. Two zero vectors are identical (0), one zero
/// vector against a non-zero one is maximally unrelated (1).
fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mag_a = magnitude(a);
    let mag_b = magnitude(b);
    match (mag_a == 0.0, mag_b == 0.0) {
        (true, true) => 0.0,
        (true, false) | (false, true) => 1.0,
        (false, false) => {
            let dot: f64 = a.iter().zip(b).map(|(p, q)| (*p as f64) * (*q as f64)).sum();
            let similarity = (dot / (mag_a * mag_b)).clamp(-1.0, 1.0);
            1.0 - similarity
        }
    }
}

fn magnitude(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

// ─── Embedder ────────────────────────────────────────────────────────────────

/// Turns text into fixed-width vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed document texts, one vector per input, in order.
    async fn embed_documents(&self, texts: &[String]) -> KlerResult<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> KlerResult<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Deterministic local embedder: feature hashing of word tokens into a
/// fixed number of buckets, L2-normalized.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            // high bit picks the sign to spread collisions
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> KlerResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> KlerResult<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ─── Vector Index ────────────────────────────────────────────────────────────

/// Exhaustive nearest-neighbour search; the corpus of one call is small.
pub struct VectorIndex {
    metric: DistanceMetric,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(metric: DistanceMetric, vectors: Vec<Vec<f32>>) -> Self {
        Self { metric, vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Closest `k` vectors as `(position, distance)`, nearest first; ties keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, self.metric.distance(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_distance_edges() {
        let m = DistanceMetric::Cosine;
        assert_eq!(m.distance(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(m.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert!(m.distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-9);
        assert!((m.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-9);
        assert!((m.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn euclidean_distance() {
        let d = DistanceMetric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 5.0).abs() < 1e-9);
    }

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("OAuth token refresh");
        let b = e.embed("oauth TOKEN refresh");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn vector_index_orders_by_distance() {
        let e = HashingEmbedder::default();
        let docs = ["refresh an oauth token", "paginate with cursors", "oauth scopes"];
        let index = VectorIndex::new(
            DistanceMetric::Cosine,
            docs.iter().map(|d| e.embed(d)).collect(),
        );
        let hits = index.search(&e.embed("oauth token refresh"), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1 <= hits[1].1);
    }

    #[test]
    fn vector_index_ties_keep_order() {
        let index = VectorIndex::new(DistanceMetric::Euclidean, vec![vec![1.0], vec![1.0], vec![1.0]]);
        let hits = index.search(&[1.0], 3);
        let order: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn embedder_trait_batches() {
        let e = HashingEmbedder::new(32);
        let out = e
            .embed_documents(&["a b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), e.dimension());
    }
}
