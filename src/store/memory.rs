//! In-memory [`VectorStore`] for tests and throwaway runs.
//!
//! Entries live in a `Vec` behind `std::sync::RwLock`; queries are a
//! brute-force cosine scan.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::StoreError;
use crate::models::VectorEntry;

use super::{check_dims, matches_filter, MetadataFilter, QueryHit, VectorStore};

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<VectorEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<VectorEntry>>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Other("vector store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<VectorEntry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Other("vector store lock poisoned".to_string()))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<(), StoreError> {
        check_dims(entries)?;
        let mut stored = self.write()?;
        for entry in entries {
            match stored.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry.clone(),
                None => stored.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>, StoreError> {
        let stored = self.read()?;
        let mut hits: Vec<QueryHit> = stored
            .iter()
            .filter(|e| matches_filter(&e.metadata, filter))
            .map(|e| QueryHit {
                id: e.id.clone(),
                document: e.content.clone(),
                metadata: e.metadata.clone(),
                distance: cosine_distance(embedding, &e.embedding),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn get(
        &self,
        ids: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<VectorEntry>, StoreError> {
        let stored = self.read()?;
        let selected: Vec<VectorEntry> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| stored.iter().find(|e| &e.id == id).cloned())
                .collect(),
            None => stored.clone(),
        };
        Ok(match limit {
            Some(n) => selected.into_iter().take(n).collect(),
            None => selected,
        })
    }

    async fn update(&self, entry: &VectorEntry) -> Result<bool, StoreError> {
        let mut stored = self.write()?;
        match stored.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|e| !ids.contains(&e.id));
        Ok(before - stored.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    async fn reset(&self) -> Result<(), StoreError> {
        self.write()?.clear();
        Ok(())
    }
}
