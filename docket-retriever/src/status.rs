//! Read-only status views returned by the service and printed by the CLI.

use crate::error::ErrorKind;
use crate::ingest::JobRecord;
use crate::storage::{Document, DocumentStatus, RegistryStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Current state of one document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusView {
    pub document_id: String,
    pub owner: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub size: u64,
    pub chunk_count: usize,
    /// Processing claims so far
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// No further automatic retry will happen
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Jobs this process knows about for the document
    pub jobs: Vec<JobRecord>,
}

impl DocumentStatusView {
    pub fn new(document: Document, jobs: Vec<JobRecord>) -> Self {
        let (error_kind, error_message, terminal) = match document.last_error {
            Some(failure) => (Some(failure.kind), Some(failure.message), failure.terminal),
            None => (None, None, false),
        };
        Self {
            document_id: document.id,
            owner: document.owner,
            filename: document.filename,
            status: document.status,
            size: document.size,
            chunk_count: document.chunk_count,
            attempts: document.attempts,
            error_kind,
            error_message,
            terminal,
            created_at: document.created_at,
            updated_at: document.updated_at,
            jobs,
        }
    }
}

impl fmt::Display for DocumentStatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Document: {}", self.document_id)?;
        writeln!(f, "  File: {} ({} bytes)", self.filename, self.size)?;
        writeln!(f, "  Owner: {}", self.owner)?;
        writeln!(f, "  Status: {}", self.status)?;
        writeln!(f, "  Chunks: {}", self.chunk_count)?;
        writeln!(f, "  Attempts: {}", self.attempts)?;
        if let (Some(kind), Some(message)) = (&self.error_kind, &self.error_message) {
            let suffix = if self.terminal { " (terminal)" } else { "" };
            writeln!(f, "  Error: {kind}{suffix}: {message}")?;
        }
        write!(
            f,
            "  Updated: {}",
            self.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Totals for one owner's documents
#[derive(Debug, Clone, Serialize)]
pub struct OwnerSummary {
    pub owner: String,
    pub documents: usize,
    pub chunks: usize,
    pub total_bytes: u64,
    pub by_status: BTreeMap<String, usize>,
    pub by_extension: BTreeMap<String, usize>,
}

impl OwnerSummary {
    pub fn new(owner: impl Into<String>, stats: RegistryStats) -> Self {
        Self {
            owner: owner.into(),
            documents: stats.documents,
            chunks: stats.chunks,
            total_bytes: stats.total_bytes,
            by_status: stats.by_status,
            by_extension: stats.by_extension,
        }
    }

    pub fn count(&self, status: DocumentStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

impl fmt::Display for OwnerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Owner: {}", self.owner)?;
        writeln!(f, "  Documents: {}", self.documents)?;
        writeln!(f, "  Chunks: {}", self.chunks)?;
        writeln!(f, "  Total size: {} bytes", self.total_bytes)?;
        let statuses: Vec<String> = DocumentStatus::ALL
            .iter()
            .map(|s| format!("{}={}", s, self.count(*s)))
            .collect();
        write!(f, "  By status: {}", statuses.join(", "))?;
        if !self.by_extension.is_empty() {
            let types: Vec<String> = self
                .by_extension
                .iter()
                .map(|(ext, n)| format!("{ext}={n}"))
                .collect();
            write!(f, "\n  By type: {}", types.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Critical,
}

/// Reachability of the stores and queue depth
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub registry_connected: bool,
    pub registry_error: Option<String>,
    pub index_connected: bool,
    pub index_error: Option<String>,
    pub vector_count: Option<usize>,
    pub queue_size: usize,
    pub overall_status: HealthStatus,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn line(connected: bool, error: &Option<String>) -> String {
            match (connected, error) {
                (true, _) => "ok".to_string(),
                (false, Some(e)) => format!("unreachable ({e})"),
                (false, None) => "unreachable".to_string(),
            }
        }
        writeln!(f, "Health: {:?}", self.overall_status)?;
        writeln!(f, "  Registry: {}", line(self.registry_connected, &self.registry_error))?;
        writeln!(f, "  Vector index: {}", line(self.index_connected, &self.index_error))?;
        if let Some(count) = self.vector_count {
            writeln!(f, "  Vectors: {count}")?;
        }
        write!(f, "  Queued jobs: {}", self.queue_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FailureRecord;

    #[test]
    fn test_status_view_flattens_failure() {
        let now = Utc::now();
        let document = Document {
            id: "abc".to_string(),
            owner: "alice".to_string(),
            filename: "notes.txt".to_string(),
            content_hash: "h".to_string(),
            size: 10,
            created_at: now,
            updated_at: now,
            status: DocumentStatus::Failed,
            last_error: Some(FailureRecord::new(
                ErrorKind::IndexUnavailable,
                "connection refused",
                true,
            )),
            chunk_count: 0,
            attempts: 4,
        };

        let view = DocumentStatusView::new(document, Vec::new());
        assert_eq!(view.error_kind, Some(ErrorKind::IndexUnavailable));
        assert!(view.terminal);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["error_kind"], "IndexUnavailable");

        let text = view.to_string();
        assert!(text.contains("Error: IndexUnavailable (terminal): connection refused"));
    }

    #[test]
    fn test_owner_summary_counts() {
        let mut stats = RegistryStats {
            documents: 3,
            ..RegistryStats::default()
        };
        stats.by_status.insert("INDEXED".to_string(), 2);
        stats.by_status.insert("FAILED".to_string(), 1);

        let summary = OwnerSummary::new("alice", stats);
        assert_eq!(summary.count(DocumentStatus::Indexed), 2);
        assert_eq!(summary.count(DocumentStatus::Pending), 0);
        assert!(summary.to_string().contains("INDEXED=2"));
    }
}
