//! SQLite-backed document registry.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE documents (
//!     id TEXT PRIMARY KEY,             -- blake3(owner, content hash), 32 hex chars
//!     owner TEXT NOT NULL,
//!     filename TEXT NOT NULL,
//!     content_hash TEXT NOT NULL,      -- hex blake3 of the uploaded bytes
//!     size INTEGER NOT NULL,
//!     created_at TIMESTAMP NOT NULL,
//!     updated_at TIMESTAMP NOT NULL,
//!     status TEXT NOT NULL,            -- PENDING | PROCESSING | INDEXED | FAILED
//!     error_kind TEXT,
//!     error_message TEXT,
//!     error_terminal INTEGER NOT NULL DEFAULT 0,
//!     chunk_count INTEGER NOT NULL DEFAULT 0,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     UNIQUE(owner, content_hash)
//! );
//!
//! CREATE TABLE chunks (
//!     id TEXT PRIMARY KEY,             -- "{document_id}:{sequence:06}"
//!     document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
//!     sequence INTEGER NOT NULL,
//!     start_offset INTEGER NOT NULL,
//!     end_offset INTEGER NOT NULL,
//!     content TEXT NOT NULL,
//!     section TEXT,
//!     page INTEGER
//! );
//! ```
//!
//! Status changes are compare-and-set updates (`... WHERE status IN (...)`), so
//! the number of affected rows tells a caller whether it won a race.

use super::{
    ChunkRecord, ClaimMode, Document, DocumentRegistry, DocumentStatus, FailureRecord,
    Registration, RegistryStats, document_id,
};
use crate::error::{ErrorKind, RegistryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};

const DOCUMENT_COLUMNS: &str = "id, owner, filename, content_hash, size, created_at, updated_at, status, error_kind, error_message, error_terminal, chunk_count, attempts";

#[derive(Clone, Debug)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        let pool = super::open_pool(path).await?;
        Self::new_with_pool(pool).await
    }

    pub async fn open_memory() -> Result<Self, RegistryError> {
        let pool = super::open_memory_pool().await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self, RegistryError> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                status TEXT NOT NULL,
                error_kind TEXT,
                error_message TEXT,
                error_terminal INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                UNIQUE(owner, content_hash)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                content TEXT NOT NULL,
                section TEXT,
                page INTEGER,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_document(row: &SqliteRow) -> Result<Document, RegistryError> {
        let status: String = row.try_get("status")?;
        let error_kind: Option<String> = row.try_get("error_kind")?;
        let last_error = match error_kind {
            Some(kind) => {
                let kind = kind
                    .parse::<ErrorKind>()
                    .map_err(|message| RegistryError::Corrupt { message })?;
                let message: Option<String> = row.try_get("error_message")?;
                let terminal: bool = row.try_get("error_terminal")?;
                Some(FailureRecord {
                    kind,
                    message: message.unwrap_or_default(),
                    terminal,
                })
            }
            None => None,
        };
        let size: i64 = row.try_get("size")?;
        let chunk_count: i64 = row.try_get("chunk_count")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(Document {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            filename: row.try_get("filename")?,
            content_hash: row.try_get("content_hash")?,
            size: size as u64,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            status: status.parse()?,
            last_error,
            chunk_count: chunk_count as usize,
            attempts: attempts as u32,
        })
    }

    fn row_to_chunk(row: &SqliteRow) -> Result<ChunkRecord, RegistryError> {
        let sequence: i64 = row.try_get("sequence")?;
        let start: i64 = row.try_get("start_offset")?;
        let end: i64 = row.try_get("end_offset")?;
        let page: Option<i64> = row.try_get("page")?;
        Ok(ChunkRecord {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            sequence: sequence as usize,
            start: start as usize,
            end: end as usize,
            text: row.try_get("content")?,
            section: row.try_get("section")?,
            page: page.map(|p| p as u32),
        })
    }

    async fn find(&self, document_id: &str) -> Result<Option<Document>, RegistryError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    /// Explain why a compare-and-set update matched no row.
    async fn lost_race(
        &self,
        document_id: &str,
        to: DocumentStatus,
    ) -> Result<RegistryError, RegistryError> {
        match self.find(document_id).await? {
            None => Ok(RegistryError::NotFound {
                id: document_id.to_string(),
            }),
            Some(doc) if doc.status == DocumentStatus::Processing && to == DocumentStatus::Processing => {
                Ok(RegistryError::AlreadyInFlight {
                    id: document_id.to_string(),
                })
            }
            Some(doc) => Ok(RegistryError::InvalidTransition {
                id: document_id.to_string(),
                from: doc.status,
                to,
            }),
        }
    }

    async fn fetch_documents(
        &self,
        clause: &str,
        bind: &str,
    ) -> Result<Vec<Document>, RegistryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE {clause} ORDER BY created_at, id"
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DocumentRegistry for SqliteRegistry {
    async fn register(
        &self,
        owner: &str,
        content_hash: &str,
        filename: &str,
        size: u64,
    ) -> Result<Registration, RegistryError> {
        let id = document_id(owner, content_hash);
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (id, owner, filename, content_hash, size, created_at, updated_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'PENDING')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(owner)
        .bind(filename)
        .bind(content_hash)
        .bind(size as i64)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let doc = self
            .find(&id)
            .await?
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;

        if inserted == 1 {
            info!("Registered document {} ({}) for {}", id, filename, owner);
            return Ok(Registration::Created(doc));
        }

        debug!("Document {} already registered with status {}", id, doc.status);
        if doc.status == DocumentStatus::Indexed {
            Err(RegistryError::DuplicateContent {
                existing: Box::new(doc),
            })
        } else {
            Ok(Registration::Existing(doc))
        }
    }

    async fn transition(
        &self,
        document_id: &str,
        new_status: DocumentStatus,
        failure: Option<&FailureRecord>,
    ) -> Result<Document, RegistryError> {
        let current = self
            .find(document_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                id: document_id.to_string(),
            })?;

        if !current.status.can_transition_to(new_status) {
            if current.status == DocumentStatus::Processing
                && new_status == DocumentStatus::Processing
            {
                return Err(RegistryError::AlreadyInFlight {
                    id: document_id.to_string(),
                });
            }
            return Err(RegistryError::InvalidTransition {
                id: document_id.to_string(),
                from: current.status,
                to: new_status,
            });
        }

        let attempts_delta: i64 = if new_status == DocumentStatus::Processing { 1 } else { 0 };
        let (kind, message, terminal) = match (new_status, failure) {
            (DocumentStatus::Failed, Some(f)) => {
                (Some(f.kind.as_str()), Some(f.message.as_str()), f.terminal)
            }
            _ => (None, None, false),
        };

        let affected = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?1, updated_at = ?2, attempts = attempts + ?3,
                error_kind = ?4, error_message = ?5, error_terminal = ?6
            WHERE id = ?7 AND status = ?8
            "#,
        )
        .bind(new_status.as_str())
        .bind(Utc::now())
        .bind(attempts_delta)
        .bind(kind)
        .bind(message)
        .bind(terminal)
        .bind(document_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(self.lost_race(document_id, new_status).await?);
        }

        debug!("Document {}: {} -> {}", document_id, current.status, new_status);
        self.get(document_id).await
    }

    async fn claim(&self, document_id: &str, mode: ClaimMode) -> Result<Document, RegistryError> {
        let accepted = mode.accepts();
        let placeholders = (0..accepted.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE documents SET status = 'PROCESSING', updated_at = ?1, attempts = attempts + 1 \
             WHERE id = ?2 AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(Utc::now()).bind(document_id);
        for status in accepted {
            query = query.bind(status.as_str());
        }
        let affected = query.execute(&self.pool).await?.rows_affected();

        if affected == 0 {
            let err = self
                .lost_race(document_id, DocumentStatus::Processing)
                .await?;
            debug!("Claim of {} refused: {}", document_id, err);
            return Err(err);
        }

        info!("Claimed document {} for processing ({:?})", document_id, mode);
        self.get(document_id).await
    }

    async fn complete(
        &self,
        document_id: &str,
        chunks: &[ChunkRecord],
    ) -> Result<Document, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'INDEXED', updated_at = ?1, chunk_count = ?2,
                error_kind = NULL, error_message = NULL, error_terminal = 0
            WHERE id = ?3 AND status = 'PROCESSING'
            "#,
        )
        .bind(Utc::now())
        .bind(chunks.len() as i64)
        .bind(document_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(self.lost_race(document_id, DocumentStatus::Indexed).await?);
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, sequence, start_offset, end_offset, content, section, page)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.sequence as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.text)
            .bind(&chunk.section)
            .bind(chunk.page.map(|p| p as i64))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("Document {} indexed with {} chunks", document_id, chunks.len());
        self.get(document_id).await
    }

    async fn fail(
        &self,
        document_id: &str,
        failure: &FailureRecord,
    ) -> Result<Document, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'FAILED', updated_at = ?1, chunk_count = 0,
                error_kind = ?2, error_message = ?3, error_terminal = ?4
            WHERE id = ?5 AND status = 'PROCESSING'
            "#,
        )
        .bind(Utc::now())
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(failure.terminal)
        .bind(document_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(self.lost_race(document_id, DocumentStatus::Failed).await?);
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!(
            "Document {} failed: {} ({}){}",
            document_id,
            failure.kind,
            failure.message,
            if failure.terminal { " [terminal]" } else { "" }
        );
        self.get(document_id).await
    }

    async fn mark_terminal(&self, document_id: &str) -> Result<bool, RegistryError> {
        let affected = sqlx::query(
            "UPDATE documents SET error_terminal = 1, updated_at = ?1 WHERE id = ?2 AND status = 'FAILED'",
        )
        .bind(Utc::now())
        .bind(document_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 && self.find(document_id).await?.is_none() {
            return Err(RegistryError::NotFound {
                id: document_id.to_string(),
            });
        }
        Ok(affected == 1)
    }

    async fn get(&self, document_id: &str) -> Result<Document, RegistryError> {
        self.find(document_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                id: document_id.to_string(),
            })
    }

    async fn list(&self, owner: &str) -> Result<Vec<Document>, RegistryError> {
        self.fetch_documents("owner = ?1", owner).await
    }

    async fn with_status(&self, status: DocumentStatus) -> Result<Vec<Document>, RegistryError> {
        self.fetch_documents("status = ?1", status.as_str()).await
    }

    async fn chunks(&self, document_id: &str) -> Result<Vec<ChunkRecord>, RegistryError> {
        let rows = sqlx::query(
            "SELECT id, document_id, sequence, start_offset, end_offset, content, section, page \
             FROM chunks WHERE document_id = ?1 ORDER BY sequence",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn delete(&self, document_id: &str) -> Result<Vec<String>, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?1 ORDER BY sequence")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let affected = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(RegistryError::NotFound {
                id: document_id.to_string(),
            });
        }

        tx.commit().await?;
        info!("Deleted document {} ({} chunks)", document_id, chunk_ids.len());
        Ok(chunk_ids)
    }

    async fn stats(&self, owner: Option<&str>) -> Result<RegistryStats, RegistryError> {
        let documents = match owner {
            Some(owner) => self.list(owner).await?,
            None => {
                let rows = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents"))
                    .fetch_all(&self.pool)
                    .await?;
                rows.iter()
                    .map(Self::row_to_document)
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let mut stats = RegistryStats::default();
        for doc in &documents {
            stats.documents += 1;
            stats.chunks += doc.chunk_count;
            stats.total_bytes += doc.size;
            *stats
                .by_status
                .entry(doc.status.as_str().to_string())
                .or_default() += 1;
            let extension = doc.extension();
            let extension = if extension.is_empty() {
                "(none)".to_string()
            } else {
                extension
            };
            *stats.by_extension.entry(extension).or_default() += 1;
        }
        Ok(stats)
    }

    async fn health(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
