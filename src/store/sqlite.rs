//! SQLite-backed [`VectorStore`].
//!
//! Every collection shares one `vector_entries` table keyed by
//! `(collection, id)`. Vectors are little-endian f32 BLOBs; ranking loads
//! the collection and scores it in Rust. Insertion order is the table's
//! rowid, which `ON CONFLICT DO UPDATE` leaves untouched.

use std::path::Path;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::error::StoreError;
use crate::models::{StoredMetadata, VectorEntry};

use super::{check_dims, matches_filter, MetadataFilter, QueryHit, VectorStore};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    /// Wrap an existing pool, creating the table if needed.
    pub async fn new(pool: SqlitePool, collection: &str) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_entries (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                document TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dims INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    /// Open a dedicated database file for the index.
    pub async fn connect(path: &Path, collection: &str) -> Result<Self, StoreError> {
        let pool = crate::db::connect_path(path)
            .await
            .map_err(|e| StoreError::Other(format!("{:#}", e)))?;
        Self::new(pool, collection).await
    }

    async fn stored_dims(&self) -> Result<Option<usize>, StoreError> {
        let row = sqlx::query("SELECT dims FROM vector_entries WHERE collection = ? LIMIT 1")
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("dims") as usize))
    }

    async fn load_all(&self) -> Result<Vec<VectorEntry>, StoreError> {
        self.load_first(None).await
    }

    /// Entries in insertion order; `LIMIT -1` is unbounded in SQLite.
    async fn load_first(&self, limit: Option<usize>) -> Result<Vec<VectorEntry>, StoreError> {
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT id, document, metadata_json, embedding FROM vector_entries \
             WHERE collection = ? ORDER BY rowid LIMIT ?",
        )
        .bind(&self.collection)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<VectorEntry, StoreError> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: StoredMetadata = serde_json::from_str(&metadata_json)?;
    let blob: Vec<u8> = row.get("embedding");
    Ok(VectorEntry {
        id: row.get("id"),
        content: row.get("document"),
        metadata,
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<(), StoreError> {
        let Some(dims) = check_dims(entries)? else {
            return Ok(());
        };
        if let Some(expected) = self.stored_dims().await? {
            if expected != dims {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: dims,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO vector_entries (collection, id, document, metadata_json, embedding, dims)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document = excluded.document,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    dims = excluded.dims
                "#,
            )
            .bind(&self.collection)
            .bind(&entry.id)
            .bind(&entry.content)
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(vec_to_blob(&entry.embedding))
            .bind(dims as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>, StoreError> {
        let mut hits: Vec<QueryHit> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|e| matches_filter(&e.metadata, filter))
            .map(|e| QueryHit {
                distance: cosine_distance(embedding, &e.embedding),
                id: e.id,
                document: e.content,
                metadata: e.metadata,
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
        let mut out = Vec::new();
        match ids {
            Some(ids) => {
                for id in ids {
                    if limit.is_some_and(|n| out.len() >= n) {
                        break;
                    }
                    let row = sqlx::query(
                        "SELECT id, document, metadata_json, embedding FROM vector_entries \
                         WHERE collection = ? AND id = ?",
                    )
                    .bind(&self.collection)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                    if let Some(row) = row {
                        out.push(row_to_entry(&row)?);
                    }
                }
            }
            None => out = self.load_first(limit).await?,
        }
        Ok(out)
    }

    async fn update(&self, entry: &VectorEntry) -> Result<bool, StoreError> {
        if let Some(expected) = self.stored_dims().await? {
            if expected != entry.embedding.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: entry.embedding.len(),
                });
            }
        }

        let result = sqlx::query(
            "UPDATE vector_entries SET document = ?, metadata_json = ?, embedding = ?, dims = ? \
             WHERE collection = ? AND id = ?",
        )
        .bind(&entry.content)
        .bind(serde_json::to_string(&entry.metadata)?)
        .bind(vec_to_blob(&entry.embedding))
        .bind(entry.embedding.len() as i64)
        .bind(&self.collection)
        .bind(&entry.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM vector_entries WHERE collection = ? AND id = ?")
                .bind(&self.collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vector_entries WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vector_entries WHERE collection = ?")
            .bind(&self.collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, v: Vec<f32>) -> VectorEntry {
        let mut metadata = StoredMetadata::new();
        metadata.insert("subject".to_string(), format!("subject {}", id));
        VectorEntry {
            id: id.to_string(),
            content: format!("doc {}", id),
            metadata,
            embedding: v,
        }
    }

    async fn open(tmp: &TempDir, collection: &str) -> SqliteVectorStore {
        SqliteVectorStore::connect(&tmp.path().join("index.sqlite"), collection)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn persists_and_ranks() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp, "emails").await;
            store
                .upsert(&[entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
                .await
                .unwrap();
        }

        let store = open(&tmp, "emails").await;
        assert_eq!(store.count().await.unwrap(), 2);
        let hits = store.query(&[0.1, 1.0], 1, None).await.unwrap();
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits[0].metadata["subject"], "subject b");
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let a = open(&tmp, "one").await;
        let b = open(&tmp, "two").await;
        a.upsert(&[entry("x", vec![1.0])]).await.unwrap();
        assert_eq!(b.count().await.unwrap(), 0);
        b.reset().await.unwrap();
        assert_eq!(a.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_order_and_rejects_dims() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp, "emails").await;
        store
            .upsert(&[entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .await
            .unwrap();
        store.upsert(&[entry("a", vec![0.5, 0.5])]).await.unwrap();

        let all = store.get(None, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(all[0].embedding, vec![0.5, 0.5]);

        let err = store.upsert(&[entry("c", vec![1.0, 0.0, 0.0])]).await;
        assert!(matches!(err, Err(StoreError::DimensionMismatch { .. })));

        assert_eq!(store.delete(&["a".into(), "zz".into()]).await.unwrap(), 1);
        assert!(!store.update(&entry("a", vec![1.0, 0.0])).await.unwrap());
    }

    #[tokio::test]
    async fn get_with_limit_returns_leading_entries() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp, "emails").await;
        let entries: Vec<VectorEntry> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| entry(id, vec![1.0, 0.0]))
            .collect();
        store.upsert(&entries).await.unwrap();

        let first = store.get(None, Some(2)).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(store.get(None, Some(usize::MAX)).await.unwrap().len(), 4);
        assert!(store.get(None, Some(0)).await.unwrap().is_empty());

        let ids = ["d".to_string(), "zz".to_string(), "a".to_string(), "b".to_string()];
        let picked = store.get(Some(&ids), Some(2)).await.unwrap();
        assert_eq!(picked.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["d", "a"]);
    }
}
