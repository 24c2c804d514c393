//! Self-describing index archive.
//!
//! `index export` writes, and `index import` reads, a single JSON document:
//!
//! ```json
//! {
//!   "collection_name": "jobtrail_emails",
//!   "embedding_model": "nomic-embed-text",
//!   "export_date": "2024-03-01T12:00:00Z",
//!   "total_count": 2,
//!   "data": {
//!     "ids": ["me_m1", "me_m2"],
//!     "documents": ["...", "..."],
//!     "metadatas": [{"category": "Interview"}, {}],
//!     "embeddings": [[0.1, 0.2], [0.3, 0.4]]
//!   }
//! }
//! ```
//!
//! The four arrays are parallel; an archive whose arrays disagree in length
//! (or with `total_count`) is rejected on read.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{StoredMetadata, VectorEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub collection_name: String,
    pub embedding_model: String,
    pub export_date: DateTime<Utc>,
    pub total_count: usize,
    pub data: ArchiveData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveData {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<StoredMetadata>,
    pub embeddings: Vec<Vec<f32>>,
}

impl ArchiveFile {
    pub fn from_entries(
        collection_name: &str,
        embedding_model: &str,
        entries: Vec<VectorEntry>,
        export_date: DateTime<Utc>,
    ) -> Self {
        let mut data = ArchiveData::default();
        for e in entries {
            data.ids.push(e.id);
            data.documents.push(e.content);
            data.metadatas.push(e.metadata);
            data.embeddings.push(e.embedding);
        }
        Self {
            collection_name: collection_name.to_string(),
            embedding_model: embedding_model.to_string(),
            export_date,
            total_count: data.ids.len(),
            data,
        }
    }

    /// Unzip the parallel arrays back into entries.
    pub fn into_entries(self) -> Result<Vec<VectorEntry>, StoreError> {
        let n = self.data.ids.len();
        let lens = [
            self.data.documents.len(),
            self.data.metadatas.len(),
            self.data.embeddings.len(),
        ];
        if lens.iter().any(|&l| l != n) {
            return Err(StoreError::Other(format!(
                "archive arrays differ in length: ids={} documents={} metadatas={} embeddings={}",
                n, lens[0], lens[1], lens[2]
            )));
        }
        if self.total_count != n {
            return Err(StoreError::Other(format!(
                "archive total_count {} does not match {} entries",
                self.total_count, n
            )));
        }

        let ArchiveData {
            ids,
            documents,
            metadatas,
            embeddings,
        } = self.data;

        Ok(ids
            .into_iter()
            .zip(documents)
            .zip(metadatas)
            .zip(embeddings)
            .map(|(((id, content), metadata), embedding)| VectorEntry {
                id,
                content,
                metadata,
                embedding,
            })
            .collect())
    }

    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
