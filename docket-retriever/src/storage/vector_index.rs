//! SQLite vector index with brute-force cosine search.
//!
//! Vectors are stored as native-endian `f16` blobs next to their JSON chunk
//! metadata, keyed by `(collection, id)`. Search loads the candidate rows of one
//! collection, narrowed by owner and document in SQL, and scores them in memory.

use super::{ChunkMetadata, SearchFilter, SearchHit, VectorIndex, VectorRecord};
use crate::error::IndexError;
use async_trait::async_trait;
use half::f16;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::cmp::Ordering;
use std::path::Path;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        let pool = super::open_pool(path).await?;
        Self::new_with_pool(pool).await
    }

    pub async fn open_memory() -> Result<Self, IndexError> {
        let pool = super::open_memory_pool().await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self, IndexError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(collection, document_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn collection_dimension(&self, collection: &str) -> Result<Option<usize>, IndexError> {
        let dimension: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM vectors WHERE collection = ?1 LIMIT 1")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dimension.map(|d| d as usize))
    }
}

fn encode_vector(vector: &[f16]) -> &[u8] {
    bytemuck::cast_slice::<f16, u8>(vector)
}

fn decode_vector(id: &str, bytes: &[u8]) -> Result<Vec<f16>, IndexError> {
    if bytes.len() % std::mem::size_of::<f16>() != 0 {
        return Err(IndexError::Corrupt {
            id: id.to_string(),
            message: format!("embedding blob has odd length {}", bytes.len()),
        });
    }
    // SQLite blobs carry no alignment guarantee
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f16::from_ne_bytes([pair[0], pair[1]]))
        .collect())
}

/// Cosine similarity in f32. Zero vectors score 0.
pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Descending score, then ascending id.
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<(), IndexError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let dimension = first.vector.len();
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: bad.vector.len(),
            });
        }
        if let Some(existing) = self.collection_dimension(collection).await? {
            if existing != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: existing,
                    actual: dimension,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let metadata = serde_json::to_string(&record.metadata).map_err(|e| {
                IndexError::Corrupt {
                    id: record.id.clone(),
                    message: e.to_string(),
                }
            })?;
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, document_id, owner, dimension, embedding, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    owner = excluded.owner,
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata
                "#,
            )
            .bind(collection)
            .bind(&record.id)
            .bind(&record.metadata.document_id)
            .bind(&record.metadata.owner)
            .bind(dimension as i64)
            .bind(encode_vector(&record.vector))
            .bind(metadata)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Upserted {} vectors into {}", records.len(), collection);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f16],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dimension) = self.collection_dimension(collection).await? {
            if dimension != query.len() {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: query.len(),
                });
            }
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, embedding, metadata FROM vectors WHERE collection = ");
        builder.push_bind(collection);
        if let Some(owner) = &filter.owner {
            builder.push(" AND owner = ").push_bind(owner.as_str());
        }
        if let Some(ids) = &filter.document_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND document_id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");
        }

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let bytes: Vec<u8> = row.try_get("embedding")?;
            let metadata: String = row.try_get("metadata")?;
            let metadata: ChunkMetadata =
                serde_json::from_str(&metadata).map_err(|e| IndexError::Corrupt {
                    id: id.clone(),
                    message: e.to_string(),
                })?;
            if !filter.matches(&metadata) {
                continue;
            }
            let vector = decode_vector(&id, &bytes)?;
            let score = cosine_similarity(query, &vector);
            hits.push(SearchHit {
                id,
                score,
                metadata,
            });
        }

        rank_hits(&mut hits);
        hits.truncate(top_k);
        debug!(
            "Search in {} returned {} hits (top_k {})",
            collection,
            hits.len(),
            top_k
        );
        Ok(hits)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, IndexError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM vectors WHERE collection = ?1 AND id = ?2")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        debug!("Deleted {} vectors from {}", removed, collection);
        Ok(removed)
    }

    async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, IndexError> {
        let removed =
            sqlx::query("DELETE FROM vectors WHERE collection = ?1 AND document_id = ?2")
                .bind(collection)
                .bind(document_id)
                .execute(&self.pool)
                .await?
                .rows_affected() as usize;
        debug!(
            "Deleted {} vectors of document {} from {}",
            removed, document_id, collection
        );
        Ok(removed)
    }

    async fn count(&self, collection: Option<&str>) -> Result<usize, IndexError> {
        let count: i64 = match collection {
            Some(collection) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?1")
                    .bind(collection)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as usize)
    }

    async fn health(&self) -> Result<(), IndexError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn v(values: &[f32]) -> Vec<f16> {
        values.iter().copied().map(f16::from_f32).collect()
    }

    fn record(id: &str, owner: &str, document_id: &str, vector: &[f32]) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector: v(vector),
            metadata: ChunkMetadata {
                document_id: document_id.to_string(),
                owner: owner.to_string(),
                sequence: 0,
                start: 0,
                end: 4,
                filename: "doc.txt".to_string(),
                text: format!("text of {id}"),
                section: None,
                page: None,
                extra: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_id() -> Result<()> {
        let index = SqliteVectorIndex::open_memory().await?;
        let records = vec![
            record("d1:000000", "alice", "d1", &[1.0, 0.0]),
            record("d1:000001", "alice", "d1", &[0.0, 1.0]),
        ];
        index.upsert("owner:alice", &records).await?;
        index.upsert("owner:alice", &records).await?;
        assert_eq!(index.count(Some("owner:alice")).await?, 2);

        let mut replaced = record("d1:000000", "alice", "d1", &[0.0, 1.0]);
        replaced.metadata.text = "replaced".to_string();
        index.upsert("owner:alice", &[replaced]).await?;
        assert_eq!(index.count(None).await?, 2);

        let hits = index
            .search("owner:alice", &v(&[0.0, 1.0]), 10, &SearchFilter::default())
            .await?;
        assert_eq!(hits[0].id, "d1:000000");
        assert_eq!(hits[0].metadata.text, "replaced");
        Ok(())
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_id() -> Result<()> {
        let index = SqliteVectorIndex::open_memory().await?;
        index
            .upsert(
                "owner:alice",
                &[
                    record("b", "alice", "d1", &[1.0, 0.0]),
                    record("a", "alice", "d1", &[1.0, 0.0]),
                    record("c", "alice", "d1", &[0.6, 0.8]),
                    record("d", "alice", "d1", &[0.0, 1.0]),
                ],
            )
            .await?;

        let hits = index
            .search("owner:alice", &v(&[1.0, 0.0]), 3, &SearchFilter::default())
            .await?;
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-3);
        assert!(hits[2].score < hits[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn test_collections_and_filters_isolate_owners() -> Result<()> {
        let index = SqliteVectorIndex::open_memory().await?;
        index
            .upsert("owner:alice", &[record("a1", "alice", "d1", &[1.0, 0.0])])
            .await?;
        index
            .upsert("owner:bob", &[record("b1", "bob", "d2", &[1.0, 0.0])])
            .await?;

        let hits = index
            .search(
                "owner:alice",
                &v(&[1.0, 0.0]),
                10,
                &SearchFilter::for_owner("alice"),
            )
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.owner, "alice");

        // Owner filter applies even inside the right collection
        let none = index
            .search("owner:alice", &v(&[1.0, 0.0]), 10, &SearchFilter::for_owner("bob"))
            .await?;
        assert!(none.is_empty());

        let by_doc = index
            .search(
                "owner:alice",
                &v(&[1.0, 0.0]),
                10,
                &SearchFilter::for_owner("alice").with_documents(vec!["other".into()]),
            )
            .await?;
        assert!(by_doc.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_and_dimension_checks() -> Result<()> {
        let dir = tempdir()?;
        let index = SqliteVectorIndex::open(&dir.path().join("vectors.db")).await?;
        index
            .upsert(
                "owner:alice",
                &[
                    record("x", "alice", "d1", &[1.0, 0.0]),
                    record("y", "alice", "d1", &[0.0, 1.0]),
                ],
            )
            .await?;

        let err = index
            .upsert("owner:alice", &[record("z", "alice", "d1", &[1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 2, actual: 3 }));

        let err = index
            .search("owner:alice", &v(&[1.0]), 5, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));

        let removed = index
            .delete("owner:alice", &["x".to_string(), "missing".to_string()])
            .await?;
        assert_eq!(removed, 1);
        assert_eq!(index.count(Some("owner:alice")).await?, 1);

        index
            .upsert("owner:alice", &[record("w", "alice", "d2", &[0.5, 0.5])])
            .await?;
        assert_eq!(index.delete_document("owner:alice", "d1").await?, 1);
        assert_eq!(index.delete_document("owner:bob", "d2").await?, 0);
        assert_eq!(index.count(Some("owner:alice")).await?, 1);
        index.health().await?;
        Ok(())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&v(&[1.0, 0.0]), &v(&[1.0, 0.0])) - 1.0).abs() < 1e-3);
        assert!(cosine_similarity(&v(&[1.0, 0.0]), &v(&[0.0, 1.0])).abs() < 1e-3);
        assert_eq!(cosine_similarity(&v(&[0.0, 0.0]), &v(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let vector = v(&[0.25, -1.5, 3.0]);
        let decoded = decode_vector("id", encode_vector(&vector)).unwrap();
        assert_eq!(decoded, vector);
        assert!(decode_vector("id", &[1, 2, 3]).is_err());
    }
}
