//! Retrieval index: embedded emails with semantic, filtered, and
//! date-range search.
//!
//! [`RetrievalIndex`] glues an [`EmbeddingProvider`] to a [`VectorStore`].
//!
//! # Scoring
//!
//! Stores rank by cosine distance and the index reports
//! `similarity = 1 - distance`. [`RetrievalIndex::rerank`] adds a lexical
//! signal on top:
//!
//! ```text
//! rerank_score = 0.7 × similarity + 0.3 × |query terms ∩ content terms| / |query terms|
//! ```
//!
//! Terms are lowercased, whitespace-separated, and compared as sets.
//!
//! # Degraded embeddings
//!
//! Empty text is never sent to the provider; it maps to a zero vector of
//! the configured dimensionality. Provider failures (and vectors of the
//! wrong size) degrade the same way with a warning, so one bad email can't
//! stop a batch.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::StoreError;
use crate::export::ArchiveFile;
use crate::models::{Category, Metadata, SearchResult, StoredMetadata, VectorEntry};
use crate::store::memory::InMemoryVectorStore;
use crate::store::sqlite::SqliteVectorStore;
use crate::store::{MetadataFilter, QueryHit, VectorStore};

const SIMILARITY_WEIGHT: f64 = 0.7;
const OVERLAP_WEIGHT: f64 = 0.3;

/// Approximate collection statistics.
///
/// Only the first `sample_size` entries are inspected, so `categories`
/// and `unique_accounts` describe the sample, not the whole collection,
/// once `total_count` exceeds it.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub collection: String,
    pub embedding_model: String,
    pub total_count: usize,
    pub sample_size: usize,
    pub categories: BTreeMap<String, usize>,
    pub unique_accounts: usize,
}

pub struct RetrievalIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    stats_sample: usize,
}

/// Deterministic entry id for an email.
pub fn entry_id(email_id: &str, account: &str) -> String {
    format!("{}_{}", account, email_id)
}

impl RetrievalIndex {
    /// Fails when the provider cannot produce vectors (zero dimensions).
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: &str,
        stats_sample: usize,
    ) -> Result<Self, StoreError> {
        if embedder.dims() == 0 {
            return Err(StoreError::Other(format!(
                "embedding provider '{}' has no dimensionality; enable [embedding] in config",
                embedder.model_name()
            )));
        }
        Ok(Self {
            store,
            embedder,
            collection: collection.to_string(),
            stats_sample: stats_sample.max(1),
        })
    }

    /// Build from `[index]`: SQLite when `path` is set, in-memory otherwise.
    pub async fn open(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn VectorStore> = match &config.index.path {
            Some(path) => {
                Arc::new(SqliteVectorStore::connect(path, &config.index.collection).await?)
            }
            None => Arc::new(InMemoryVectorStore::new()),
        };
        Self::new(
            store,
            embedder,
            &config.index.collection,
            config.index.stats_sample,
        )
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Embed one text. Never fails; see the module docs.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let dims = self.dims();
        if text.trim().is_empty() {
            return vec![0.0; dims];
        }

        match self.embedder.embed(&[text.to_string()]).await {
            Ok(mut vectors) if vectors.len() == 1 && vectors[0].len() == dims => vectors.remove(0),
            Ok(vectors) => {
                warn!(
                    expected = dims,
                    got = vectors.first().map(|v| v.len()).unwrap_or(0),
                    "embedding has wrong shape, using zero vector"
                );
                vec![0.0; dims]
            }
            Err(e) => {
                warn!(error = %e, "embedding failed, using zero vector");
                vec![0.0; dims]
            }
        }
    }

    /// Embed and upsert `content`. Returns the entry id.
    ///
    /// Without an explicit `id`, one is derived from the `email_id` and
    /// `account` metadata (or a content hash when `email_id` is absent).
    pub async fn add(
        &self,
        content: &str,
        metadata: &Metadata,
        id: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => derive_id(content, metadata),
        };
        let entry = VectorEntry {
            id: id.clone(),
            content: content.to_string(),
            metadata: flatten_metadata(metadata),
            embedding: self.embed(content).await,
        };
        self.store.upsert(std::slice::from_ref(&entry)).await?;
        debug!(id = %id, "indexed entry");
        Ok(id)
    }

    /// Re-embed and overwrite an existing entry. `false` when `id` is unknown.
    pub async fn update(
        &self,
        id: &str,
        content: &str,
        metadata: &Metadata,
    ) -> Result<bool, StoreError> {
        let entry = VectorEntry {
            id: id.to_string(),
            content: content.to_string(),
            metadata: flatten_metadata(metadata),
            embedding: self.embed(content).await,
        };
        self.store.update(&entry).await
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embed(query).await;
        let hits = self.store.query(&embedding, k, filter).await?;
        Ok(hits.into_iter().map(hit_to_result).collect())
    }

    pub async fn search_by_category(
        &self,
        category: Category,
        k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let mut filter = MetadataFilter::new();
        filter.insert("category".to_string(), category.as_str().to_string());
        self.search(&format!("emails about {}", category), k, Some(&filter))
            .await
    }

    /// Entries whose `date` metadata falls in `[start, end]`, newest first.
    ///
    /// Compares the `YYYY-MM-DD` prefix of the stored date as a string, so
    /// this is a full scan. Every hit has similarity 1.0.
    pub async fn search_by_timeframe(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let start = start.format("%Y-%m-%d").to_string();
        let end = end.format("%Y-%m-%d").to_string();

        let mut matched: Vec<VectorEntry> = self
            .store
            .get(None, None)
            .await?
            .into_iter()
            .filter(|e| {
                e.metadata
                    .get("date")
                    .and_then(|d| d.get(..10))
                    .map(|day| day >= start.as_str() && day <= end.as_str())
                    .unwrap_or(false)
            })
            .collect();

        matched.sort_by(|a, b| b.metadata.get("date").cmp(&a.metadata.get("date")));
        matched.truncate(k);

        Ok(matched
            .into_iter()
            .map(|e| SearchResult {
                id: e.id,
                content: e.content,
                metadata: e.metadata,
                similarity: 1.0,
                distance: 0.0,
                rerank_score: None,
            })
            .collect())
    }

    /// Score `results` by similarity and keyword overlap, best first,
    /// keeping at most `top_k`. Ties keep their incoming order.
    pub fn rerank(&self, query: &str, results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
        rerank(query, results, top_k)
    }

    /// Retrieve `k` candidates and rerank them down to `top_k` when there
    /// are more candidates than that.
    pub async fn search_with_rerank(
        &self,
        query: &str,
        k: usize,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let candidates = self.search(query, k, None).await?;
        if candidates.len() > top_k {
            Ok(rerank(query, candidates, top_k))
        } else {
            Ok(candidates)
        }
    }

    /// Neighbours of a stored entry, excluding the entry itself.
    pub async fn get_similar_to(&self, id: &str, k: usize) -> Result<Vec<SearchResult>, StoreError> {
        let ids = [id.to_string()];
        let found = self.store.get(Some(&ids), Some(1)).await?;
        let Some(source) = found.into_iter().next() else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        let hits = self.store.query(&source.embedding, k.saturating_add(1), None).await?;
        Ok(hits
            .into_iter()
            .filter(|h| h.id != id)
            .take(k)
            .map(hit_to_result)
            .collect())
    }

    /// Write the whole collection to an archive. Returns the entry count.
    pub async fn export_all(&self, path: &Path) -> Result<usize, StoreError> {
        let entries = self.store.get(None, None).await?;
        let archive = ArchiveFile::from_entries(
            &self.collection,
            self.embedder.model_name(),
            entries,
            Utc::now(),
        );
        archive.write(path)?;
        info!(count = archive.total_count, path = %path.display(), "exported index");
        Ok(archive.total_count)
    }

    /// Add every archived entry. Existing ids are overwritten; nothing is
    /// removed first.
    pub async fn import_all(&self, path: &Path) -> Result<usize, StoreError> {
        let archive = ArchiveFile::read(path)?;
        if archive.embedding_model != self.embedder.model_name() {
            warn!(
                archived = %archive.embedding_model,
                current = %self.embedder.model_name(),
                "importing vectors from a different embedding model"
            );
        }
        let entries = archive.into_entries()?;
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != self.dims()) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims(),
                actual: bad.embedding.len(),
            });
        }
        self.store.upsert(&entries).await?;
        info!(count = entries.len(), path = %path.display(), "imported index");
        Ok(entries.len())
    }

    /// `false` when `id` was not stored.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.store.delete(&[id.to_string()]).await? > 0)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count().await
    }

    pub async fn stats(&self) -> Result<IndexStats, StoreError> {
        let total_count = self.store.count().await?;
        let sample = self.store.get(None, Some(self.stats_sample)).await?;

        let mut categories = BTreeMap::new();
        let mut accounts = HashSet::new();
        for e in &sample {
            let category = e
                .metadata
                .get("category")
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            *categories.entry(category).or_insert(0) += 1;
            if let Some(account) = e.metadata.get("account") {
                accounts.insert(account.clone());
            }
        }

        Ok(IndexStats {
            collection: self.collection.clone(),
            embedding_model: self.embedder.model_name().to_string(),
            total_count,
            sample_size: sample.len(),
            categories,
            unique_accounts: accounts.len(),
        })
    }

    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.reset().await?;
        info!(collection = %self.collection, "index reset");
        Ok(())
    }
}

/// See [`RetrievalIndex::rerank`].
pub fn rerank(query: &str, results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
    let query_terms = terms(query);

    let mut scored: Vec<SearchResult> = results
        .into_iter()
        .map(|mut r| {
            let overlap = if query_terms.is_empty() {
                0.0
            } else {
                let content_terms = terms(&r.content);
                query_terms.intersection(&content_terms).count() as f64 / query_terms.len() as f64
            };
            r.rerank_score = Some(SIMILARITY_WEIGHT * r.similarity + OVERLAP_WEIGHT * overlap);
            r
        })
        .collect();

    // sort_by is stable, so equal scores keep their retrieval order.
    scored.sort_by(|a, b| {
        b.rerank_score
            .unwrap_or(0.0)
            .total_cmp(&a.rerank_score.unwrap_or(0.0))
    });
    scored.truncate(top_k);
    scored
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

fn hit_to_result(hit: QueryHit) -> SearchResult {
    SearchResult {
        id: hit.id,
        content: hit.document,
        metadata: hit.metadata,
        similarity: 1.0 - hit.distance,
        distance: hit.distance,
        rerank_score: None,
    }
}

fn flatten_metadata(metadata: &Metadata) -> StoredMetadata {
    metadata
        .iter()
        .filter_map(|(k, v)| v.to_metadata_string().map(|s| (k.clone(), s)))
        .collect()
}

fn derive_id(content: &str, metadata: &Metadata) -> String {
    let account = metadata
        .get("account")
        .and_then(|v| v.to_metadata_string())
        .unwrap_or_default();
    match metadata.get("email_id").and_then(|v| v.to_metadata_string()) {
        Some(email_id) if !email_id.is_empty() => entry_id(&email_id, &account),
        _ => {
            let digest = Sha256::digest(content.as_bytes());
            let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
            entry_id(&format!("doc_{}", hex), &account)
        }
    }
}
