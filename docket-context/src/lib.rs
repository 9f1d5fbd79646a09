pub mod text;

// Re-export the chunker for external use
pub use text::{ChunkError, Chunker, ChunkerConfig, DEFAULT_BOUNDARY_PATTERNS, TextChunk};
