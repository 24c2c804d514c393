//! Relational store for canonical emails and their classifications.
//!
//! One `emails` row per `(account, external_id)`. Rows are written once by
//! ingestion, then updated by the background classifier
//! ([`EmailStore::record_classification`]) and the indexer
//! ([`EmailStore::set_embedding_id`]). Timestamps are Unix seconds.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{
    CanonicalEmail, Category, ClassificationResult, ClassificationSource, SenderInfo, StoredEmail,
};

const COLUMNS: &str = "id, account, external_id, thread_id, subject, sender, sender_name, \
    sender_address, recipient, snippet, body, received_at, labels_json, company, category, \
    confidence, summary, key_info_json, classification_source, processed_at, is_processed, \
    embedding_id, created_at";

/// Result of [`EmailStore::upsert_email`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub row_id: i64,
    /// `false` when the row already existed and was left untouched.
    pub inserted: bool,
}

/// Optional constraints for [`EmailStore::list`]. All given ones must hold.
#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub account: Option<String>,
    pub category: Option<Category>,
    /// Substring match over subject, snippet, and sender.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailPage {
    pub emails: Vec<StoredEmail>,
    /// Matching rows before `limit`/`offset`.
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub total: i64,
    pub processed: i64,
    pub pending: i64,
    pub indexed: i64,
    pub by_category: BTreeMap<String, i64>,
}

#[derive(Clone)]
pub struct EmailStore {
    pool: SqlitePool,
}

impl EmailStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `[db] path` and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("opening database {}", config.db.path.display()))?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Insert `email` unless its `(account, external_id)` is already stored.
    pub async fn upsert_email(&self, email: &CanonicalEmail) -> Result<Upserted> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO emails (account, external_id, thread_id, subject, sender, sender_name,
                                sender_address, recipient, snippet, body, received_at,
                                labels_json, company, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account, external_id) DO NOTHING
            "#,
        )
        .bind(&email.account)
        .bind(&email.external_id)
        .bind(&email.thread_id)
        .bind(&email.subject)
        .bind(&email.sender)
        .bind(&email.sender_info.name)
        .bind(&email.sender_info.address)
        .bind(&email.recipient)
        .bind(&email.snippet)
        .bind(&email.body)
        .bind(email.received_at.timestamp())
        .bind(serde_json::to_string(&email.labels)?)
        .bind(&email.company)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row_id: i64 =
            sqlx::query_scalar("SELECT id FROM emails WHERE account = ? AND external_id = ?")
                .bind(&email.account)
                .bind(&email.external_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Upserted {
            row_id,
            inserted: result.rows_affected() > 0,
        })
    }

    pub async fn get(&self, row_id: i64) -> Result<Option<StoredEmail>> {
        let row = sqlx::query(&format!("SELECT {} FROM emails WHERE id = ?", COLUMNS))
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_email).transpose()
    }

    pub async fn get_by_external_id(
        &self,
        account: &str,
        external_id: &str,
    ) -> Result<Option<StoredEmail>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM emails WHERE account = ? AND external_id = ?",
            COLUMNS
        ))
        .bind(account)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_email).transpose()
    }

    /// Store a classification and mark the row processed.
    pub async fn record_classification(
        &self,
        row_id: i64,
        result: &ClassificationResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE emails SET
                category = ?, confidence = ?, summary = ?, key_info_json = ?,
                classification_source = ?, processed_at = ?, is_processed = 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result.category.as_str())
        .bind(result.confidence)
        .bind(&result.summary)
        .bind(serde_json::to_string(&result.key_info)?)
        .bind(result.source.as_str())
        .bind(result.processed_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_embedding_id(&self, row_id: i64, embedding_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE emails SET embedding_id = ?, updated_at = ? WHERE id = ?")
            .bind(embedding_id)
            .bind(Utc::now().timestamp())
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest first, paged.
    pub async fn list(&self, filter: &EmailFilter, limit: i64, offset: i64) -> Result<EmailPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(account) = &filter.account {
            clauses.push("account = ?");
            binds.push(account.clone());
        }
        if let Some(category) = filter.category {
            clauses.push("category = ?");
            binds.push(category.as_str().to_string());
        }
        if let Some(term) = filter.search.as_deref().filter(|t| !t.trim().is_empty()) {
            clauses.push(
                "(subject LIKE ? ESCAPE '\\' OR snippet LIKE ? ESCAPE '\\' OR sender LIKE ? ESCAPE '\\')",
            );
            let pattern = like_pattern(term.trim());
            binds.extend(std::iter::repeat(pattern).take(3));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM emails {}", where_sql);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let list_sql = format!(
            "SELECT {} FROM emails {} ORDER BY received_at DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS, where_sql
        );
        let mut list_query = sqlx::query(&list_sql);
        for b in &binds {
            list_query = list_query.bind(b);
        }
        let rows = list_query
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;

        let emails = rows.iter().map(row_to_email).collect::<Result<Vec<_>>>()?;
        Ok(EmailPage { emails, total })
    }

    pub async fn search(&self, term: &str, limit: i64) -> Result<Vec<StoredEmail>> {
        let filter = EmailFilter {
            search: Some(term.to_string()),
            ..Default::default()
        };
        Ok(self.list(&filter, limit, 0).await?.emails)
    }

    /// Emails received in the last `days` days, newest first.
    pub async fn recent(&self, days: i64, now: DateTime<Utc>) -> Result<Vec<StoredEmail>> {
        let cutoff = (now - Duration::days(days)).timestamp();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM emails WHERE received_at >= ? ORDER BY received_at DESC, id DESC",
            COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_email).collect()
    }

    /// Rows the classifier has not reached yet, oldest first.
    pub async fn unprocessed(&self, limit: i64) -> Result<Vec<StoredEmail>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM emails WHERE is_processed = 0 ORDER BY id ASC LIMIT ?",
            COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_email).collect()
    }

    pub async fn pipeline_stats(&self) -> Result<PipelineStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(is_processed), 0) AS processed,
                COUNT(embedding_id) AS indexed
            FROM emails
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let processed: i64 = row.get("processed");

        let category_rows = sqlx::query(
            "SELECT category, COUNT(*) AS n FROM emails WHERE category IS NOT NULL \
             GROUP BY category ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_category = category_rows
            .iter()
            .map(|r| (r.get::<String, _>("category"), r.get::<i64, _>("n")))
            .collect();

        Ok(PipelineStats {
            total,
            processed,
            pending: total - processed,
            indexed: row.get("indexed"),
            by_category,
        })
    }

    /// Remove a row, returning it so callers can clean up the index entry.
    pub async fn delete(&self, row_id: i64) -> Result<Option<StoredEmail>> {
        let Some(existing) = self.get(row_id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM emails WHERE id = ?")
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(Some(existing))
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM emails")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn row_to_email(row: &SqliteRow) -> Result<StoredEmail> {
    let labels_json: String = row.get("labels_json");
    let labels: Vec<String> = serde_json::from_str(&labels_json).unwrap_or_default();

    let email = CanonicalEmail {
        external_id: row.get("external_id"),
        account: row.get("account"),
        subject: row.get("subject"),
        sender: row.get("sender"),
        sender_info: SenderInfo {
            name: row.get("sender_name"),
            address: row.get("sender_address"),
        },
        recipient: row.get("recipient"),
        snippet: row.get("snippet"),
        body: row.get("body"),
        received_at: ts(row.get("received_at")),
        thread_id: row.get("thread_id"),
        labels,
        company: row.get("company"),
    };

    let category: Option<String> = row.get("category");
    let classification = match category {
        Some(label) => {
            let key_info_json: Option<String> = row.get("key_info_json");
            let key_info = key_info_json
                .and_then(|j| serde_json::from_str(&j).ok())
                .unwrap_or_default();
            let source: Option<String> = row.get("classification_source");
            let processed_at: Option<i64> = row.get("processed_at");
            Some(ClassificationResult {
                category: Category::parse(&label).unwrap_or(Category::Other),
                confidence: row.get::<Option<f64>, _>("confidence").unwrap_or(0.0),
                summary: row.get::<Option<String>, _>("summary").unwrap_or_default(),
                key_info,
                processed_at: ts(processed_at.unwrap_or(0)),
                source: ClassificationSource::parse(source.as_deref().unwrap_or("model")),
            })
        }
        None => None,
    };

    Ok(StoredEmail {
        row_id: row.get("id"),
        email,
        classification,
        is_processed: row.get::<i64, _>("is_processed") != 0,
        embedding_id: row.get("embedding_id"),
        created_at: ts(row.get("created_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn email(id: &str, subject: &str, received_at: DateTime<Utc>) -> CanonicalEmail {
        CanonicalEmail {
            external_id: id.to_string(),
            account: "me@example.com".to_string(),
            subject: subject.to_string(),
            sender: "HR Team <hr@techcorp.com>".to_string(),
            sender_info: SenderInfo {
                name: "HR Team".to_string(),
                address: "hr@techcorp.com".to_string(),
            },
            recipient: "me@example.com".to_string(),
            snippet: format!("{} snippet", subject),
            body: "body".to_string(),
            received_at,
            thread_id: String::new(),
            labels: vec!["INBOX".to_string()],
            company: "Techcorp".to_string(),
        }
    }

    async fn store(tmp: &TempDir) -> EmailStore {
        EmailStore::open(&Config::minimal(tmp.path().join("jobtrail.sqlite")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_account_and_id() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let first = store.upsert_email(&email("m1", "Hello", t)).await.unwrap();
        assert!(first.inserted);
        let second = store.upsert_email(&email("m1", "Changed", t)).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(first.row_id, second.row_id);

        let stored = store.get(first.row_id).await.unwrap().unwrap();
        assert_eq!(stored.email.subject, "Hello");
        assert_eq!(stored.email.received_at, t);
        assert_eq!(stored.email.labels, vec!["INBOX"]);
        assert!(!stored.is_processed);
        assert!(stored.classification.is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn classification_and_stats() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let a = store.upsert_email(&email("a", "Interview", t)).await.unwrap();
        store.upsert_email(&email("b", "Newsletter", t)).await.unwrap();

        let result = ClassificationResult::new(
            Category::Interview,
            0.9,
            "Phone screen",
            serde_json::Map::new(),
            ClassificationSource::Model,
        );
        store.record_classification(a.row_id, &result).await.unwrap();
        store.set_embedding_id(a.row_id, Some("me@example.com_a")).await.unwrap();

        let stored = store.get_by_external_id("me@example.com", "a").await.unwrap().unwrap();
        let c = stored.classification.unwrap();
        assert_eq!(c.category, Category::Interview);
        assert_eq!(c.summary, "Phone screen");
        assert!(stored.is_processed);
        assert_eq!(stored.embedding_id.as_deref(), Some("me@example.com_a"));

        let stats = store.pipeline_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.by_category.get("Interview"), Some(&1));

        let pending = store.unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].email.external_id, "b");
    }

    #[tokio::test]
    async fn list_filters_pages_and_escapes() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        for (i, subject) in ["Offer 100% remote", "Offer onsite", "Weekly digest"].iter().enumerate() {
            let t = Utc.with_ymd_and_hms(2024, 3, 1 + i as u32, 9, 0, 0).unwrap();
            store.upsert_email(&email(&format!("m{}", i), subject, t)).await.unwrap();
        }

        let page = store.list(&EmailFilter::default(), 2, 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.emails.len(), 2);
        assert_eq!(page.emails[0].email.subject, "Weekly digest");

        let offers = store.search("offer", 10).await.unwrap();
        assert_eq!(offers.len(), 2);

        let literal = store.search("100%", 10).await.unwrap();
        assert_eq!(literal.len(), 1);

        let underscore = store.search("_", 10).await.unwrap();
        assert!(underscore.is_empty());

        let other_account = EmailFilter {
            account: Some("someone@else.com".into()),
            ..Default::default()
        };
        assert_eq!(store.list(&other_account, 10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn recent_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let old = store
            .upsert_email(&email("old", "Old", now - Duration::days(40)))
            .await
            .unwrap();
        store
            .upsert_email(&email("new", "New", now - Duration::days(1)))
            .await
            .unwrap();

        let recent = store.recent(30, now).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].email.external_id, "new");

        let removed = store.delete(old.row_id).await.unwrap().unwrap();
        assert_eq!(removed.email.external_id, "old");
        assert!(store.delete(old.row_id).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
