//! Query engine: embed the query, search the owner's collection, drop
//! near-duplicate passages and return the best `top_k`.

use crate::config::{DocketConfig, RetrievalSettings};
use crate::error::RetrievalError;
use crate::storage::{
    collection_key, DocumentRegistry, DocumentStatus, SearchFilter, SearchHit, VectorIndex,
};
use docket_embed::EmbeddingProvider;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub owner: String,
    pub top_k: usize,
    /// Extra constraints. The owner is always taken from `owner`.
    pub filter: SearchFilter,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, owner: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            owner: owner.into(),
            top_k,
            filter: SearchFilter::default(),
        }
    }

    /// Restrict results to these documents.
    pub fn with_documents(mut self, document_ids: Vec<String>) -> Self {
        self.filter = self.filter.with_documents(document_ids);
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// One retrieved chunk with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub sequence: usize,
    pub start: usize,
    pub end: usize,
    pub section: Option<String>,
    pub page: Option<u32>,
    pub text: String,
    pub score: f32,
}

impl From<SearchHit> for Passage {
    fn from(hit: SearchHit) -> Self {
        let m = hit.metadata;
        Self {
            chunk_id: hit.id,
            document_id: m.document_id,
            filename: m.filename,
            sequence: m.sequence,
            start: m.start,
            end: m.end,
            section: m.section,
            page: m.page,
            text: m.text,
            score: hit.score,
        }
    }
}

/// Ranked passages for one query, best first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub passages: Vec<Passage>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Numbered context block for a generation prompt.
    pub fn to_context(&self) -> String {
        let mut out = String::new();
        for (i, p) in self.passages.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            let _ = write!(out, "[{}] {}", i + 1, p.filename);
            if let Some(page) = p.page {
                let _ = write!(out, ", page {page}");
            }
            if let Some(section) = &p.section {
                let _ = write!(out, ", section \"{section}\"");
            }
            let _ = write!(out, " (score {:.3})\n{}", p.score, p.text.trim());
        }
        out
    }
}

pub struct RetrievalEngine {
    registry: Arc<dyn DocumentRegistry>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: RetrievalSettings,
    embed_timeout: Duration,
    index_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            registry,
            index,
            embedder,
            settings,
            embed_timeout: Duration::from_secs(30),
            index_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(
        config: &DocketConfig,
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self::new(registry, index, embedder, config.retrieval.clone())
            .with_timeouts(config.embedding.timeout(), config.index.timeout())
    }

    pub fn with_timeouts(mut self, embed: Duration, index: Duration) -> Self {
        self.embed_timeout = embed;
        self.index_timeout = index;
        self
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Retrieve passages for a query. Infrastructure failures are errors; an
    /// empty result means no INDEXED document scored above `min_score`.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievalResult, RetrievalError> {
        if query.text.trim().is_empty() {
            return Err(RetrievalError::InvalidConfig {
                message: "query text is empty".to_string(),
            });
        }
        if query.owner.is_empty() {
            return Err(RetrievalError::InvalidConfig {
                message: "query owner is empty".to_string(),
            });
        }
        if query.top_k == 0 {
            return Ok(RetrievalResult {
                query: query.text.clone(),
                passages: Vec::new(),
            });
        }

        let vector = tokio::time::timeout(self.embed_timeout, self.embedder.embed_text(&query.text))
            .await
            .map_err(|_| RetrievalError::EmbeddingUnavailable {
                message: format!("query embedding timed out after {:?}", self.embed_timeout),
            })??;

        let mut filter = query.filter.clone();
        filter.owner = Some(query.owner.clone());
        let fetch = query.top_k.saturating_mul(self.settings.effective_overfetch());

        let hits = tokio::time::timeout(
            self.index_timeout,
            self.index
                .search(&collection_key(&query.owner), &vector, fetch, &filter),
        )
        .await
        .map_err(|_| RetrievalError::IndexUnavailable {
            message: format!("index search timed out after {:?}", self.index_timeout),
        })??;

        let hits = self.indexed_only(&query.owner, hits).await?;
        let candidates = hits.len();
        let above: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.score > self.settings.min_score)
            .collect();
        let below = candidates - above.len();

        let mut passages = dedup_hits(above, self.settings.dedup_threshold);
        let duplicates = candidates - below - passages.len();
        passages.truncate(query.top_k);

        info!(
            "Query for {}: {} candidates, {} below min score, {} duplicates, {} returned",
            query.owner,
            candidates,
            below,
            duplicates,
            passages.len()
        );
        Ok(RetrievalResult {
            query: query.text.clone(),
            passages,
        })
    }

    /// Drop hits whose document is not INDEXED, such as vectors a failed
    /// attempt could not remove.
    async fn indexed_only(
        &self,
        owner: &str,
        hits: Vec<SearchHit>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let indexed: HashSet<String> = self
            .registry
            .list(owner)
            .await?
            .into_iter()
            .filter(|d| d.status == DocumentStatus::Indexed)
            .map(|d| d.id)
            .collect();
        let before = hits.len();
        let kept: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| indexed.contains(&h.metadata.document_id))
            .collect();
        if kept.len() < before {
            debug!(
                "Ignored {} hits from documents that are not indexed",
                before - kept.len()
            );
        }
        Ok(kept)
    }
}

/// Keep the best-scoring passage among near-identical chunks of the same
/// document. `hits` must be ranked best first.
pub fn dedup_hits(hits: Vec<SearchHit>, threshold: f32) -> Vec<Passage> {
    let mut kept: Vec<Passage> = Vec::with_capacity(hits.len());
    let mut words_by_doc: HashMap<String, Vec<HashSet<String>>> = HashMap::new();

    for hit in hits {
        let words = word_set(&hit.metadata.text);
        let seen = words_by_doc
            .entry(hit.metadata.document_id.clone())
            .or_default();
        if let Some(similar) = seen.iter().find(|other| jaccard(&words, other) >= threshold) {
            debug!(
                "Dropping {} as near-duplicate ({:.2})",
                hit.id,
                jaccard(&words, similar)
            );
            continue;
        }
        seen.push(words);
        kept.push(Passage::from(hit));
    }
    kept
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of two word sets; two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f32 / union as f32
}
