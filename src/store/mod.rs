//! Vector storage abstraction.
//!
//! The [`VectorStore`] trait is the nearest-neighbor service behind
//! [`crate::index::RetrievalIndex`]. Two backends ship:
//!
//! - [`memory::InMemoryVectorStore`]: `RwLock<Vec<_>>`, for tests and
//!   throwaway runs.
//! - [`sqlite::SqliteVectorStore`]: one table per database, scoped by
//!   collection name, with BLOB vectors.
//!
//! Both rank by brute-force cosine distance, so `similarity = 1 - distance`.
//! Entries keep insertion order; upserting an existing id keeps its slot.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{StoredMetadata, VectorEntry};

/// Equality constraints over stored metadata, all of which must hold.
pub type MetadataFilter = BTreeMap<String, String>;

/// A nearest-neighbor hit.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    pub metadata: StoredMetadata,
    pub distance: f64,
}

/// Abstract nearest-neighbor store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite entries by id |
/// | [`query`](VectorStore::query) | k nearest entries, optionally filtered |
/// | [`get`](VectorStore::get) | Entries by id, or the first `limit` |
/// | [`update`](VectorStore::update) | Overwrite an existing entry |
/// | [`delete`](VectorStore::delete) | Remove entries, returning how many existed |
/// | [`count`](VectorStore::count) | Number of entries |
/// | [`reset`](VectorStore::reset) | Drop every entry |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<(), StoreError>;

    /// Entries ordered by ascending cosine distance to `embedding`.
    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>, StoreError>;

    /// `ids = None` returns entries in insertion order, up to `limit`.
    async fn get(
        &self,
        ids: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<VectorEntry>, StoreError>;

    /// Returns `false` when `entry.id` is not stored.
    async fn update(&self, entry: &VectorEntry) -> Result<bool, StoreError>;

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    async fn reset(&self) -> Result<(), StoreError>;
}

pub(crate) fn matches_filter(metadata: &StoredMetadata, filter: Option<&MetadataFilter>) -> bool {
    filter.map_or(true, |f| {
        f.iter()
            .all(|(k, v)| metadata.get(k).map(|m| m == v).unwrap_or(false))
    })
}

/// Every entry in a batch must have the same dimensionality.
pub(crate) fn check_dims(entries: &[VectorEntry]) -> Result<Option<usize>, StoreError> {
    let Some(first) = entries.first() else {
        return Ok(None);
    };
    let expected = first.embedding.len();
    for e in entries {
        if e.embedding.len() != expected {
            return Err(StoreError::DimensionMismatch {
                expected,
                actual: e.embedding.len(),
            });
        }
    }
    Ok(Some(expected))
}
