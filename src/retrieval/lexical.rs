//! BM25 keyword index over the chunks of one retrieval call.

use std::collections::HashMap;

use super::tokenizer::tokenize;

const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Document-length normalization, 0 disables it.
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

pub struct LexicalIndex {
    params: Bm25Params,
    term_counts: Vec<HashMap<String, usize>>,
    doc_len: Vec<usize>,
    avg_doc_len: f64,
    idf: HashMap<String, f64>,
}

impl LexicalIndex {
    pub fn build<S: AsRef<str>>(docs: &[S], params: Bm25Params) -> Self {
        let mut term_counts = Vec::with_capacity(docs.len());
        let mut doc_len = Vec::with_capacity(docs.len());
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for doc in docs {
            let tokens = tokenize(doc.as_ref());
            doc_len.push(tokens.len());
            let mut counts: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
            for term in counts.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            term_counts.push(counts);
        }

        let n = docs.len() as f64;
        let idf = doc_freqs
            .into_iter()
            .map(|(term, df)| {
                let df = df as f64;
                (term, ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();
        let avg_doc_len = if docs.is_empty() {
            0.0
        } else {
            doc_len.iter().sum::<usize>() as f64 / n
        };

        Self {
            params,
            term_counts,
            doc_len,
            avg_doc_len,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_len.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_len.is_empty()
    }

    fn score(&self, query_terms: &[String], doc: usize) -> f64 {
        let Bm25Params { k1, b } = self.params;
        let len_norm = 1.0 - b + b * (self.doc_len[doc] as f64 / self.avg_doc_len);
        query_terms
            .iter()
            .filter_map(|term| {
                let idf = self.idf.get(term)?;
                let tf = *self.term_counts[doc].get(term).unwrap_or(&0) as f64;
                Some(idf * tf * (k1 + 1.0) / (tf + k1 * len_norm + SCORE_EPSILON))
            })
            .sum()
    }

    /// Top `k` documents as `(position, score)`, best first. Documents
    /// without any matching term are omitted; ties keep document order.
    pub fn search(&self, query: &str, k: usize) -> Vec<(usize, f64)> {
        if self.is_empty() || self.avg_doc_len == 0.0 || k == 0 {
            return Vec::new();
        }
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = (0..self.len())
            .map(|i| (i, self.score(&terms, i)))
            .filter(|(_, s)| *s > SCORE_EPSILON)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<&'static str> {
        vec![
            "OAuth 2.0 authentication requires a client id and secret",
            "Rate limits apply per endpoint",
            "Use the bearer token in the Authorization header for authentication",
            "Pagination uses cursor parameters",
        ]
    }

    #[test]
    fn ranks_matching_documents() {
        let index = LexicalIndex::build(&corpus(), Bm25Params::default());
        let hits = index.search("authentication token", 10);
        assert_eq!(hits[0].0, 2);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(i, _)| *i == 0 || *i == 2));
    }

    #[test]
    fn no_match_returns_empty() {
        let index = LexicalIndex::build(&corpus(), Bm25Params::default());
        assert!(index.search("kubernetes", 5).is_empty());
        assert!(index.search("!!!", 5).is_empty());
    }

    #[test]
    fn rare_terms_weigh_more() {
        let docs = vec!["common common rare", "common common common", "common other"];
        let index = LexicalIndex::build(&docs, Bm25Params::default());
        let hits = index.search("rare common", 3);
        assert_eq!(hits[0].0, 0);
    }

    #[test]
    fn truncates_to_k() {
        let docs = vec!["a x", "a y", "a z"];
        let index = LexicalIndex::build(&docs, Bm25Params::default());
        let hits = index.search("a", 2);
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].0, hits[1].0), (0, 1));
    }

    #[test]
    fn length_normalization_toggle() {
        let docs = vec!["token", "token filler filler filler filler filler"];
        let normalized = LexicalIndex::build(&docs, Bm25Params { k1: 1.5, b: 0.75 });
        let hits = normalized.search("token", 2);
        assert!(hits[0].1 > hits[1].1);

        let flat = LexicalIndex::build(&docs, Bm25Params { k1: 1.5, b: 0.0 });
        let hits = flat.search("token", 2);
        assert!((hits[0].1 - hits[1].1).abs() < 1e-9);
    }

    #[test]
    fn empty_index() {
        let docs: Vec<String> = Vec::new();
        let index = LexicalIndex::build(&docs, Bm25Params::default());
        assert!(index.search("anything", 3).is_empty());
    }
}
