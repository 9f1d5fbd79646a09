//! Uploaded content storage and plain-text extraction.
//!
//! Supported formats are plain text (`txt`, `md`) and `pdf`. PDF pages are
//! separated by form feeds in the extracted text; every page with text is
//! prefixed with a `[Page N]` marker so the chunker can attribute chunks to
//! pages.

use super::Document;
use crate::error::ExtractError;
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Text extracted from a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub char_count: usize,
    pub word_count: usize,
    /// Pages with text, for paginated formats
    pub pages: Option<usize>,
}

impl ExtractedText {
    pub fn new(text: String, pages: Option<usize>) -> Self {
        Self {
            char_count: text.chars().count(),
            word_count: text.split_whitespace().count(),
            text,
            pages,
        }
    }
}

/// Source of a document's plain text.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn load_text(&self, document: &Document) -> Result<ExtractedText, ExtractError>;
}

/// Stores uploaded bytes as `<root>/<document id>` and extracts text by file extension.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, document_id: &str) -> PathBuf {
        self.root.join(document_id)
    }

    /// Write the bytes for a document. Every write goes through its own
    /// temporary file in the store root, so a reader never sees a partial blob
    /// and concurrent writers of one document cannot clobber each other.
    pub async fn put(&self, document_id: &str, bytes: &[u8]) -> std::io::Result<()> {
        let root = self.root.clone();
        let path = self.blob_path(document_id);
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&root)?;
            tmp.write_all(&owned)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        debug!("Stored {} bytes for {}", bytes.len(), document_id);
        Ok(())
    }

    /// Remove a stored blob. Missing blobs are not an error.
    pub async fn remove(&self, document_id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.blob_path(document_id)).await {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn exists(&self, document_id: &str) -> bool {
        tokio::fs::try_exists(self.blob_path(document_id))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContentSource for FsContentStore {
    async fn load_text(&self, document: &Document) -> Result<ExtractedText, ExtractError> {
        let bytes = match tokio::fs::read(self.blob_path(&document.id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(ExtractError::malformed(format!(
                    "no stored content for document {}",
                    document.id
                )));
            }
            Err(e) => return Err(ExtractError::unavailable(e.to_string())),
        };

        let extension = document.extension();
        let extracted = match extension.as_str() {
            "txt" | "md" => ExtractedText::new(decode_text(&bytes)?, None),
            "pdf" => {
                let (text, pages) = tokio::task::spawn_blocking(move || extract_pdf(&bytes))
                    .await
                    // pdf-extract panics on some malformed files
                    .map_err(|e| ExtractError::malformed(format!("PDF parser failed: {e}")))??;
                ExtractedText::new(text, Some(pages))
            }
            other => {
                return Err(ExtractError::malformed(format!(
                    "unsupported file type: {other:?}"
                )));
            }
        };

        info!(
            "Extracted text from {}: {} characters, {} words",
            document.filename, extracted.char_count, extracted.word_count
        );
        Ok(extracted)
    }
}

/// UTF-8 with a Latin-1 fallback. NUL bytes mark binary content.
pub fn decode_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.contains(&0) {
        return Err(ExtractError::malformed("binary content in a text file"));
    }
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };
    Ok(text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text))
}

fn extract_pdf(bytes: &[u8]) -> Result<(String, usize), ExtractError> {
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractError::malformed(format!("PDF extraction failed: {e}")))?;
    let (text, pages) = paginate(&raw);
    if text.trim().is_empty() {
        return Err(ExtractError::malformed(
            "could not extract text from PDF; it may be image-based or corrupted",
        ));
    }
    Ok((text, pages))
}

/// Split on form feeds and prefix each non-empty page with `[Page N]`.
fn paginate(raw: &str) -> (String, usize) {
    let parts: Vec<String> = raw
        .split('\u{c}')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| format!("[Page {}]\n{}", i + 1, page.trim()))
        .collect();
    let count = parts.len();
    (parts.join("\n\n"), count)
}
