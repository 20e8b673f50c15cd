//! Section chunking of fetched documentation.

use serde::{Deserialize, Serialize};

/// Section separator used by the documentation service: a newline followed
/// by a rule of 32 dashes.
pub const SECTION_DELIMITER: &str = "\n--------------------------------";

/// A section-sized span of one fetched document, scoped to one retrieval call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    /// Position among the document's non-empty sections.
    pub section_index: usize,
    pub text: String,
}

impl Chunk {
    /// First line of the chunk, capped at `max_chars`.
    pub fn title(&self, max_chars: usize) -> String {
        let line = self.text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        line.trim().chars().take(max_chars).collect()
    }

    pub fn snippet(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

/// Split a document into trimmed, non-empty sections.
pub fn chunk_by_section(doc_id: &str, text: &str) -> Vec<Chunk> {
    text.split(SECTION_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(section_index, s)| Chunk {
            doc_id: doc_id.to_string(),
            section_index,
            text: s.to_string(),
        })
        .collect()
}
