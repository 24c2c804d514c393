//! End-to-end orchestration: ingest, classify, index, answer.
//!
//! ```text
//! raw export ─▶ normalize ─▶ dedupe ─▶ (filter) ─▶ EmailStore rows
//!                                                       │
//!                                          tokio::spawn │ background
//!                                                       ▼
//!                          batch_classify ─▶ record_classification ─▶ index.add
//! ```
//!
//! [`Pipeline::ingest`] returns as soon as the rows are stored; the
//! classification of the new rows runs on a spawned task whose handle is
//! handed back. Every component is constructed once and shared by `Arc`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{ClassificationChain, ClassifySettings};
use crate::config::Config;
use crate::email_store::{EmailStore, PipelineStats};
use crate::embedding::create_provider;
use crate::index::{entry_id, IndexStats, RetrievalIndex};
use crate::inference::{GenerateOptions, Generation, InferenceClient};
use crate::insights::{analyze_progress, suggest_follow_ups};
use crate::models::{
    ClassificationResult, ClassificationSource, ClassifiedEmail, FollowUp, Metadata, MetaValue,
    ProgressReport, SearchResult, StoredEmail,
};
use crate::normalize::{deduplicate, filter_relevant, normalize_at, validate, ExportFormat};
use crate::progress::{ClassifyProgressEvent, NoProgress, ProgressReporter};

/// Entries shown under "recent activity" in the inbox summary.
const RECENT_ACTIVITY: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Drop emails that don't look job-related before storing them.
    pub relevant_only: bool,
}

/// What happened to one ingested export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub parsed: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub filtered_out: usize,
    pub already_stored: usize,
    /// Newly stored rows queued for classification.
    pub accepted: usize,
}

pub struct Ingestion {
    pub report: IngestReport,
    /// Background classification of the accepted rows, if any.
    pub task: Option<JoinHandle<ProcessReport>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub classified: u64,
    pub fallback: u64,
    pub failed: u64,
    pub indexed: u64,
    /// Rows whose result could not be written back.
    pub store_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub date: DateTime<Utc>,
    pub subject: String,
    pub sender: String,
    pub category: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxSummary {
    pub summary: String,
    pub stats: PipelineStats,
    pub recent_activity: Vec<RecentActivity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub inference: String,
    pub inference_healthy: bool,
    pub current_model: String,
    pub emails: i64,
    /// `None` when embeddings are disabled.
    pub index: Option<IndexStats>,
}

#[derive(Clone)]
pub struct Pipeline {
    emails: EmailStore,
    chain: Arc<ClassificationChain>,
    index: Option<Arc<RetrievalIndex>>,
    batch_size: usize,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        emails: EmailStore,
        chain: Arc<ClassificationChain>,
        index: Option<Arc<RetrievalIndex>>,
        batch_size: usize,
    ) -> Self {
        Self {
            emails,
            chain,
            index,
            batch_size: batch_size.max(1),
            progress: Arc::new(NoProgress),
        }
    }

    /// Wire up every component from configuration.
    ///
    /// Fails when the database or index location cannot be opened, or the
    /// embedding provider cannot be built.
    pub async fn open(config: &Config) -> Result<Self> {
        let emails = EmailStore::open(config).await?;
        let llm = InferenceClient::from_config(&config.inference)
            .context("building inference client")?;
        let chain = ClassificationChain::new(Arc::new(llm), ClassifySettings::from_config(config));

        let index = if config.embedding.is_enabled() {
            let provider = create_provider(config)?;
            let index = RetrievalIndex::open(config, provider)
                .await
                .context("opening retrieval index")?;
            Some(Arc::new(index))
        } else {
            info!("embeddings disabled; emails will be classified but not indexed");
            None
        };

        Ok(Self::new(
            emails,
            Arc::new(chain),
            index,
            config.classify.batch_size,
        ))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn emails(&self) -> &EmailStore {
        &self.emails
    }

    pub fn chain(&self) -> &ClassificationChain {
        &self.chain
    }

    /// The retrieval index, or an error explaining how to enable it.
    pub fn index(&self) -> Result<&RetrievalIndex> {
        match &self.index {
            Some(index) => Ok(index),
            None => bail!("semantic search requires embeddings; set [embedding] provider in config"),
        }
    }

    /// Normalize and store an export, then classify the new rows in the
    /// background.
    pub async fn ingest(
        &self,
        raw: &[u8],
        format: ExportFormat,
        account: &str,
        options: IngestOptions,
    ) -> Result<Ingestion> {
        let normalized = normalize_at(raw, format, account, Utc::now());
        let mut report = IngestReport {
            parsed: normalized.emails.len(),
            malformed: normalized.failures.len(),
            ..Default::default()
        };

        let (valid, invalid): (Vec<_>, Vec<_>) =
            normalized.emails.into_iter().partition(validate);
        for email in &invalid {
            warn!(external_id = %email.external_id, "skipping email with missing required fields");
        }
        report.malformed += invalid.len();

        let deduped = deduplicate(valid);
        report.duplicates = deduped.removed();

        let candidates = if options.relevant_only {
            let before = deduped.records.len();
            let kept = filter_relevant(deduped.records);
            report.filtered_out = before - kept.len();
            kept
        } else {
            deduped.records
        };

        let mut accepted = Vec::new();
        for email in &candidates {
            let upserted = self.emails.upsert_email(email).await?;
            if upserted.inserted {
                if let Some(row) = self.emails.get(upserted.row_id).await? {
                    accepted.push(row);
                }
            } else {
                report.already_stored += 1;
            }
        }
        report.accepted = accepted.len();

        info!(
            account,
            format = %format,
            parsed = report.parsed,
            malformed = report.malformed,
            duplicates = report.duplicates,
            accepted = report.accepted,
            "ingest stored"
        );

        let task = if accepted.is_empty() {
            None
        } else {
            let worker = self.clone();
            Some(tokio::spawn(async move { worker.process_rows(accepted).await }))
        };

        Ok(Ingestion { report, task })
    }

    /// Classify (and index) up to `limit` unprocessed rows, in the foreground.
    pub async fn process_pending(&self, limit: i64) -> Result<ProcessReport> {
        let rows = self.emails.unprocessed(limit).await?;
        if rows.is_empty() {
            info!("no unprocessed emails");
            return Ok(ProcessReport::default());
        }
        Ok(self.process_rows(rows).await)
    }

    /// Classify rows batch by batch. Never fails; problems are counted.
    pub async fn process_rows(&self, rows: Vec<StoredEmail>) -> ProcessReport {
        let total = rows.len() as u64;
        let mut report = ProcessReport::default();
        let mut done = 0u64;

        for batch in rows.chunks(self.batch_size) {
            self.progress
                .report(ClassifyProgressEvent::Classifying { done, total });

            let contents: Vec<String> = batch.iter().map(|r| r.email.classification_text()).collect();
            let results = self.chain.batch_classify(&contents).await;

            for (row, result) in batch.iter().zip(results) {
                match result.source {
                    ClassificationSource::Model => {}
                    ClassificationSource::KeywordFallback => report.fallback += 1,
                    ClassificationSource::Failed => report.failed += 1,
                }

                if let Err(e) = self.emails.record_classification(row.row_id, &result).await {
                    error!(row_id = row.row_id, error = %e, "failed to store classification");
                    report.store_errors += 1;
                    continue;
                }
                report.classified += 1;

                if self.index_row(row, &result).await {
                    report.indexed += 1;
                }

                debug!(
                    external_id = %row.email.external_id,
                    category = %result.category,
                    "processed email"
                );
            }

            done += batch.len() as u64;
            self.progress.report(ClassifyProgressEvent::Stored { done, total });
        }

        self.progress.report(ClassifyProgressEvent::Finished {
            classified: report.classified,
            fallback: report.fallback,
            failed: report.failed,
        });
        info!(
            classified = report.classified,
            fallback = report.fallback,
            failed = report.failed,
            indexed = report.indexed,
            "classification run finished"
        );
        report
    }

    async fn index_row(&self, row: &StoredEmail, result: &ClassificationResult) -> bool {
        let Some(index) = &self.index else {
            return false;
        };
        let email = &row.email;
        let id = entry_id(&email.external_id, &email.account);

        let mut metadata = Metadata::new();
        metadata.insert("email_id".into(), email.external_id.clone().into());
        metadata.insert("row_id".into(), row.row_id.into());
        metadata.insert("account".into(), email.account.clone().into());
        metadata.insert("category".into(), result.category.as_str().into());
        metadata.insert("date".into(), MetaValue::Timestamp(email.received_at));
        metadata.insert("subject".into(), email.subject.clone().into());
        metadata.insert("sender".into(), email.sender.clone().into());
        metadata.insert("company".into(), email.company.clone().into());
        metadata.insert("confidence".into(), result.confidence.into());
        metadata.insert("source".into(), result.source.as_str().into());

        match index
            .add(&email.classification_text(), &metadata, Some(&id))
            .await
        {
            Ok(id) => {
                if let Err(e) = self.emails.set_embedding_id(row.row_id, Some(&id)).await {
                    error!(row_id = row.row_id, error = %e, "failed to record embedding id");
                }
                true
            }
            Err(e) => {
                error!(id = %id, error = %e, "failed to index email");
                false
            }
        }
    }

    pub async fn classify_text(&self, text: &str) -> ClassificationResult {
        self.chain.classify(text).await
    }

    /// Retrieve the `limit` closest emails and have the model answer from them.
    pub async fn query(&self, query: &str, limit: usize) -> Result<QueryAnswer> {
        let index = self.index()?;
        let sources = index.search(query, limit, None).await?;

        let context = sources
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "Based on the following emails, answer this question: {}\n\nEmails:\n{}",
            query, context
        );

        let answer = match self.chain.llm().generate(&prompt, &GenerateOptions::default()).await {
            Generation::Text(text) => text,
            failed @ Generation::Failed(_) => {
                warn!(query, "query answer generation failed");
                failed.to_string()
            }
        };

        Ok(QueryAnswer {
            query: query.to_string(),
            answer,
            sources,
        })
    }

    /// Delete a stored email and its index entry. `None` when the row is unknown.
    pub async fn delete_email(&self, row_id: i64) -> Result<Option<StoredEmail>> {
        let Some(row) = self.emails.get(row_id).await? else {
            return Ok(None);
        };

        if let (Some(embedding_id), Some(index)) = (&row.embedding_id, &self.index) {
            if !index.delete(embedding_id).await? {
                warn!(id = %embedding_id, "index entry already gone");
            }
        }

        self.emails.delete(row_id).await
    }

    pub async fn health(&self) -> Result<PipelineHealth> {
        let status = self.chain.llm().health_check().await;
        let index = match &self.index {
            Some(index) => Some(index.stats().await?),
            None => None,
        };
        Ok(PipelineHealth {
            inference: status.to_string(),
            inference_healthy: status.is_healthy(),
            current_model: self.chain.llm().current_model(),
            emails: self.emails.count().await?,
            index,
        })
    }

    async fn classified_since(&self, days: i64, now: DateTime<Utc>) -> Result<Vec<ClassifiedEmail>> {
        Ok(self
            .emails
            .recent(days, now)
            .await?
            .iter()
            .filter_map(StoredEmail::classified)
            .collect())
    }

    /// Narrative summary of the last `days` days plus pipeline counts.
    pub async fn summary(&self, days: i64) -> Result<InboxSummary> {
        let now = Utc::now();
        let recent = self.emails.recent(days, now).await?;
        let classified: Vec<ClassifiedEmail> =
            recent.iter().filter_map(StoredEmail::classified).collect();

        let summary = self.chain.generate_inbox_summary(&classified).await;
        let recent_activity = recent
            .iter()
            .take(RECENT_ACTIVITY)
            .map(|r| RecentActivity {
                date: r.email.received_at,
                subject: r.email.subject.clone(),
                sender: r.email.sender.clone(),
                category: r.classification.as_ref().map(|c| c.category.to_string()),
                summary: r.classification.as_ref().map(|c| c.summary.clone()),
            })
            .collect();

        Ok(InboxSummary {
            summary,
            stats: self.emails.pipeline_stats().await?,
            recent_activity,
        })
    }

    pub async fn progress(&self, days: i64) -> Result<ProgressReport> {
        let now = Utc::now();
        let emails = self.classified_since(days, now).await?;
        Ok(analyze_progress(&emails, days, now))
    }

    /// Follow-up suggestions over emails from the last `days` days.
    pub async fn follow_ups(&self, days: i64) -> Result<Vec<FollowUp>> {
        let now = Utc::now();
        let emails = self.classified_since(days, now).await?;
        Ok(suggest_follow_ups(&emails, now))
    }
}
