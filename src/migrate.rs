use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `jobtrail init`: create the database and its schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // One row per (account, message). Classification columns stay NULL
    // until the background classifier gets to the row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            external_id TEXT NOT NULL,
            thread_id TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL,
            sender TEXT NOT NULL,
            sender_name TEXT NOT NULL DEFAULT '',
            sender_address TEXT NOT NULL DEFAULT '',
            recipient TEXT NOT NULL DEFAULT '',
            snippet TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            received_at INTEGER NOT NULL,
            labels_json TEXT NOT NULL DEFAULT '[]',
            company TEXT NOT NULL DEFAULT '',
            category TEXT,
            confidence REAL,
            summary TEXT,
            key_info_json TEXT,
            classification_source TEXT,
            processed_at INTEGER,
            is_processed INTEGER NOT NULL DEFAULT 0,
            embedding_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(account, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_received ON emails(received_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_category ON emails(category)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_processed ON emails(is_processed)")
        .execute(pool)
        .await?;

    Ok(())
}
