//! Query-time retrieval over the vector index.

pub mod engine;

pub use engine::{Passage, RetrievalEngine, RetrievalQuery, RetrievalResult, dedup_hits, jaccard};
