//! Documentation retrieval.
//!
//! A retrieval call plans sub-queries, finds the target document, fetches it
//! once per sub-query, splits it into sections and ranks them with BM25 and
//! vector search fused by reciprocal rank. Results across sub-queries are
//! merged, de-duplicated and optionally reranked. Indexes are built per call
//! and never shared.

pub mod chunker;
pub mod discovery;
pub mod embedding;
pub mod fusion;
pub mod lexical;
pub mod pipeline;
pub mod planner;
pub mod rerank;
pub mod semantic;
pub mod tokenizer;

pub use chunker::{chunk_by_section, Chunk, SECTION_DELIMITER};
pub use discovery::{Context7Client, DocumentRef, DocumentSource};
pub use embedding::VoyageEmbedder;
pub use fusion::{deduplicate_chunks, reciprocal_rank_fusion, ScoredChunk};
pub use lexical::{Bm25Params, LexicalIndex};
pub use pipeline::{not_found_marker, RetrievalPipeline, RetrievalReport};
pub use planner::{EnginePlanner, PassthroughPlanner, QueryPlan, QueryPlanner};
pub use rerank::{EngineReranker, OverlapReranker, Reranker};
pub use semantic::{DistanceMetric, Embedder, HashingEmbedder, VectorIndex};
