//! Overlapping text chunker for document ingestion.
//!
//! This module splits extracted document text into passages that are small enough
//! to embed individually while keeping enough surrounding text for each passage to
//! make sense on its own. Consecutive chunks share a fixed overlap window so that a
//! sentence cut at a boundary is still seen whole by at least one chunk.
//!
//! # Algorithm
//!
//! Sizes are counted in characters (not bytes), and every [`TextChunk`] records its
//! character offsets into the source text.
//!
//! 1. Text no longer than `target_size` becomes exactly one chunk.
//! 2. Otherwise, starting at offset 0, the chunk is allowed to extend up to
//!    `start + target_size` characters (the hard end).
//! 3. Inside a lookback window ending at the hard end, the chunker looks for the
//!    most significant boundary available, in order: paragraph break, sentence end,
//!    line break, whitespace. The chunk ends right after the last such boundary.
//! 4. If no boundary is found the chunk is cut at the hard end.
//! 5. The next chunk starts `overlap` characters before the previous chunk's end.
//!
//! The window never reaches back past `start + overlap`, so every chunk makes
//! forward progress and the union of chunk spans covers the whole text.
//!
//! # Example
//!
//! ```
//! use docket_context::text::{Chunker, ChunkerConfig};
//!
//! let chunker = Chunker::new(ChunkerConfig::new(20, 5)).unwrap();
//! let chunks = chunker.split("The sky is blue. Grass is green.");
//!
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "The sky is blue. ");
//! assert_eq!(chunks[1].start, chunks[0].end - 5);
//! assert_eq!(chunks[1].end, 32);
//! ```
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Boundary patterns, most significant first.
///
/// - `\n\s*\n`: paragraph breaks (blank lines).
/// - `[.!?]["')\]]*\s+`: sentence ends, including trailing quotes or brackets.
/// - `\n`: line breaks.
/// - `\s+`: any run of whitespace.
pub const DEFAULT_BOUNDARY_PATTERNS: &[&str] = &[
    r"\n\s*\n",              // Paragraphs
    r#"[.!?]["')\]]*\s+"#,   // Sentences
    r"\n",                   // Line breaks
    r"\s+",                  // Whitespace
];

const HEADING_PATTERN: &str = r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t#]*$";
const PAGE_MARKER_PATTERN: &str = r"\[Page (\d+)\]";

/// Errors raised by the chunker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Sizes or boundary patterns that cannot produce a valid chunking.
    #[error("Invalid chunker configuration: {message}")]
    InvalidConfig { message: String },
}

impl ChunkError {
    fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Sizing for the chunker, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum number of characters in a chunk
    pub target_size: usize,
    /// Number of characters shared by consecutive chunks; must be below `target_size`
    pub overlap: usize,
    /// How far back from the hard end the chunker searches for a boundary
    pub lookback: usize,
}

impl ChunkerConfig {
    /// Create a configuration with the default lookback (a quarter of `target_size`, at least 1).
    pub fn new(target_size: usize, overlap: usize) -> Self {
        Self {
            target_size,
            overlap,
            lookback: default_lookback(target_size),
        }
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Check the sizing invariants without building a chunker.
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.target_size == 0 {
            return Err(ChunkError::invalid_config("target_size must be greater than 0"));
        }
        if self.overlap >= self.target_size {
            return Err(ChunkError::invalid_config(format!(
                "overlap ({}) must be strictly less than target_size ({})",
                self.overlap, self.target_size
            )));
        }
        Ok(())
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self::new(1000, 100)
    }
}

/// Default lookback window for a given target size.
pub fn default_lookback(target_size: usize) -> usize {
    (target_size / 4).max(1)
}

/// A contiguous span of a document's text.
///
/// Offsets are character offsets into the source text; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Position of this chunk within the document (0-indexed)
    pub sequence: usize,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    /// The chunk text, exactly `source[start..end]` in characters
    pub text: String,
    /// Nearest preceding Markdown heading, if any
    pub section: Option<String>,
    /// Nearest preceding `[Page N]` marker, if any
    pub page: Option<u32>,
}

impl TextChunk {
    /// Number of characters in the chunk.
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Deterministic overlapping chunker.
///
/// Identical input and configuration always produce identical chunk boundaries.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    boundaries: Vec<Regex>,
    heading: Regex,
    page_marker: Regex,
}

impl Chunker {
    /// Create a chunker with the default boundary patterns.
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkError> {
        Self::with_boundaries(config, DEFAULT_BOUNDARY_PATTERNS)
    }

    /// Create a chunker with custom boundary patterns, most significant first.
    pub fn with_boundaries(config: ChunkerConfig, patterns: &[&str]) -> Result<Self, ChunkError> {
        config.validate()?;

        let boundaries = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ChunkError::invalid_config(format!("invalid boundary pattern {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let heading = Regex::new(HEADING_PATTERN)
            .map_err(|e| ChunkError::invalid_config(e.to_string()))?;
        let page_marker = Regex::new(PAGE_MARKER_PATTERN)
            .map_err(|e| ChunkError::invalid_config(e.to_string()))?;

        Ok(Self {
            config,
            boundaries,
            heading,
            page_marker,
        })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into overlapping chunks. Empty text yields no chunks.
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let offsets = CharOffsets::new(text);
        let total = offsets.char_len();
        if total == 0 {
            return Vec::new();
        }

        let spans = self.spans(text, &offsets);
        let sections = self.markers(text, &offsets, &self.heading, |m| Some(m.to_string()));
        let pages = self.markers(text, &offsets, &self.page_marker, |m| m.parse::<u32>().ok());

        spans
            .into_iter()
            .enumerate()
            .map(|(sequence, span)| TextChunk {
                sequence,
                text: text[offsets.byte_range(span.clone())].to_string(),
                section: marker_for(&sections, &span),
                page: marker_for(&pages, &span),
                start: span.start,
                end: span.end,
            })
            .collect()
    }

    /// Compute chunk spans as character ranges.
    fn spans(&self, text: &str, offsets: &CharOffsets) -> Vec<Range<usize>> {
        let ChunkerConfig {
            target_size,
            overlap,
            lookback,
        } = self.config;
        let total = offsets.char_len();

        if total <= target_size {
            return vec![0..total];
        }

        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let hard_end = (start + target_size).min(total);
            if hard_end == total {
                spans.push(start..total);
                break;
            }

            let window_start = (start + overlap + 1).max(hard_end.saturating_sub(lookback));
            let end = self
                .find_boundary(text, offsets, window_start, hard_end)
                .unwrap_or(hard_end);

            spans.push(start..end);
            start = end - overlap;
        }
        spans
    }

    /// Find the best cut point in `(window_start, hard_end]`, as a character offset.
    fn find_boundary(
        &self,
        text: &str,
        offsets: &CharOffsets,
        window_start: usize,
        hard_end: usize,
    ) -> Option<usize> {
        if window_start >= hard_end {
            return None;
        }
        let window = &text[offsets.byte_range(window_start..hard_end)];
        let window_base = offsets.byte_at(window_start);

        for boundary in &self.boundaries {
            if let Some(mat) = boundary.find_iter(window).last() {
                let cut = offsets.char_at(window_base + mat.end());
                if cut > window_start {
                    return Some(cut);
                }
            }
        }
        None
    }

    fn markers<T>(
        &self,
        text: &str,
        offsets: &CharOffsets,
        pattern: &Regex,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Vec<(usize, T)> {
        pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let value = parse(caps.get(1)?.as_str().trim())?;
                Some((offsets.char_at(whole.start()), value))
            })
            .collect()
    }
}

/// The marker in effect for a span: the last one at or before its start, or else
/// the first one inside it.
fn marker_for<T: Clone>(markers: &[(usize, T)], span: &Range<usize>) -> Option<T> {
    let before = markers.partition_point(|(pos, _)| *pos <= span.start);
    if before > 0 {
        return Some(markers[before - 1].1.clone());
    }
    markers
        .first()
        .filter(|(pos, _)| *pos < span.end)
        .map(|(_, value)| value.clone())
}

/// Byte offset of every character boundary in a string, for char/byte conversion.
struct CharOffsets {
    bytes: Vec<usize>,
}

impl CharOffsets {
    fn new(text: &str) -> Self {
        let mut bytes: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bytes.push(text.len());
        Self { bytes }
    }

    fn char_len(&self) -> usize {
        self.bytes.len() - 1
    }

    fn byte_at(&self, char_idx: usize) -> usize {
        self.bytes[char_idx]
    }

    fn byte_range(&self, chars: Range<usize>) -> Range<usize> {
        self.bytes[chars.start]..self.bytes[chars.end]
    }

    /// Character offset of a byte position that lies on a char boundary.
    fn char_at(&self, byte_idx: usize) -> usize {
        self.bytes.partition_point(|&b| b < byte_idx)
    }
}
