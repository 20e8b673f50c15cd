//! Reciprocal rank fusion and de-duplication of ranked chunks.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use super::chunker::Chunk;

/// A chunk with the score it was ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Combine ranked lists with RRF: `score(id) = Σ 1 / (k + rank)` over every
/// list containing `id`, with 1-based ranks.
///
/// Output is sorted by fused score, best first. Equal scores are ordered by
/// id, so identical inputs always produce identical output.
pub fn reciprocal_rank_fusion<K>(lists: &[Vec<K>], rrf_k: f64) -> Vec<(K, f64)>
where
    K: Eq + Hash + Ord + Clone,
{
    let mut scores: HashMap<K, f64> = HashMap::new();
    for list in lists {
        let mut seen: HashSet<&K> = HashSet::new();
        for (rank, id) in list.iter().enumerate() {
            // a repeated id within one list only counts at its best rank
            if !seen.insert(id) {
                continue;
            }
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (rrf_k + (rank as f64) + 1.0);
        }
    }

    let mut fused: Vec<(K, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

/// Drop chunks whose text was already seen, keeping the first (best ranked)
/// occurrence.
pub fn deduplicate_chunks(chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    let mut seen: HashSet<String> = HashSet::new();
    chunks
        .into_iter()
        .filter(|c| seen.insert(c.chunk.text.trim().to_string()))
        .collect()
}
