//! Core data types shared across the pipeline.
//!
//! These types flow between every stage:
//!
//! ```text
//! raw export ─▶ CanonicalEmail ─▶ ClassificationResult ─▶ VectorEntry ─▶ SearchResult
//!               (normalize)       (classify)              (index.add)     (index.search)
//! ```
//!
//! All types derive `Serialize` so commands can emit them as JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clean::truncate_chars;

/// Parsed `From:` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub name: String,
    /// Lowercased; empty when the header carried no address.
    pub address: String,
}

/// A single email in the uniform shape every downstream stage consumes.
///
/// Produced only by [`crate::normalize`], which guarantees a non-empty
/// `external_id` and a cleaned `snippet`/`body`. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEmail {
    /// Provider message id (or a content hash when the export has none).
    pub external_id: String,
    /// Mailbox the export belongs to.
    pub account: String,
    pub subject: String,
    /// Raw `From:` header value.
    pub sender: String,
    pub sender_info: SenderInfo,
    pub recipient: String,
    pub snippet: String,
    pub body: String,
    /// Parsed header date, or ingestion time when unparseable.
    pub received_at: DateTime<Utc>,
    pub thread_id: String,
    pub labels: Vec<String>,
    /// Organisation guessed from the sender's domain.
    pub company: String,
}

impl CanonicalEmail {
    /// Text fed to classification and embedding: subject plus snippet.
    pub fn classification_text(&self) -> String {
        format!("{} {}", self.subject, self.snippet).trim().to_string()
    }
}

/// Fixed category set for job-search email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Application Sent")]
    ApplicationSent,
    #[serde(rename = "Recruiter Response")]
    RecruiterResponse,
    Interview,
    Offer,
    Rejection,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::ApplicationSent,
        Category::RecruiterResponse,
        Category::Interview,
        Category::Offer,
        Category::Rejection,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ApplicationSent => "Application Sent",
            Category::RecruiterResponse => "Recruiter Response",
            Category::Interview => "Interview",
            Category::Offer => "Offer",
            Category::Rejection => "Rejection",
            Category::Other => "Other",
        }
    }

    /// Match a label case-insensitively, ignoring surrounding whitespace.
    pub fn parse(label: &str) -> Option<Category> {
        let label = label.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a classification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Parsed from a structured model response.
    Model,
    /// Model answered but not in JSON; keyword rules were applied.
    KeywordFallback,
    /// The model could not be reached or the flow failed outright.
    Failed,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Model => "model",
            ClassificationSource::KeywordFallback => "keyword_fallback",
            ClassificationSource::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> ClassificationSource {
        match s {
            "keyword_fallback" => ClassificationSource::KeywordFallback,
            "failed" => ClassificationSource::Failed,
            _ => ClassificationSource::Model,
        }
    }
}

/// Outcome of classifying one email.
///
/// Construct through [`ClassificationResult::new`] so that confidence is
/// clamped to `[0, 1]` and the summary is bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f64,
    pub summary: String,
    pub key_info: serde_json::Map<String, serde_json::Value>,
    pub processed_at: DateTime<Utc>,
    pub source: ClassificationSource,
}

impl ClassificationResult {
    pub const SUMMARY_MAX_CHARS: usize = 200;

    pub fn new(
        category: Category,
        confidence: f64,
        summary: &str,
        key_info: serde_json::Map<String, serde_json::Value>,
        source: ClassificationSource,
    ) -> Self {
        Self {
            category,
            confidence: clamp_confidence(confidence),
            summary: truncate_chars(summary, Self::SUMMARY_MAX_CHARS),
            key_info,
            processed_at: Utc::now(),
            source,
        }
    }

    /// The degraded result used when the model is unreachable.
    pub fn failed(reason: &str) -> Self {
        Self::new(
            Category::Other,
            0.0,
            &format!("Classification error: {}", reason),
            serde_json::Map::new(),
            ClassificationSource::Failed,
        )
    }

    /// True when the result did not come from a validated model response.
    pub fn is_degraded(&self) -> bool {
        self.source != ClassificationSource::Model
    }
}

/// Clamp into `[0, 1]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// An email row as persisted by [`crate::email_store::EmailStore`].
#[derive(Debug, Clone, Serialize)]
pub struct StoredEmail {
    pub row_id: i64,
    pub email: CanonicalEmail,
    pub classification: Option<ClassificationResult>,
    pub is_processed: bool,
    pub embedding_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredEmail {
    /// Pair with its classification; unclassified rows yield `None`.
    pub fn classified(&self) -> Option<ClassifiedEmail> {
        self.classification.as_ref().map(|c| ClassifiedEmail {
            email: self.email.clone(),
            classification: c.clone(),
        })
    }
}

/// An email together with its classification, the input to the insight
/// generators.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedEmail {
    pub email: CanonicalEmail,
    pub classification: ClassificationResult,
}

/// Metadata value accepted by [`crate::index::RetrievalIndex::add`].
///
/// Everything is flattened to a string before it reaches the store;
/// timestamps become ISO-8601, `Null` values are dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Null,
}

impl MetaValue {
    pub fn to_metadata_string(&self) -> Option<String> {
        match self {
            MetaValue::Text(s) => Some(s.clone()),
            MetaValue::Int(i) => Some(i.to_string()),
            MetaValue::Float(f) => Some(f.to_string()),
            MetaValue::Bool(b) => Some(b.to_string()),
            MetaValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            MetaValue::Null => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(f: f64) -> Self {
        MetaValue::Float(f)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for MetaValue {
    fn from(ts: DateTime<Utc>) -> Self {
        MetaValue::Timestamp(ts)
    }
}

impl<T: Into<MetaValue>> From<Option<T>> for MetaValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(MetaValue::Null)
    }
}

/// Caller-supplied metadata, before flattening.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Flattened, string-only metadata as stored alongside each vector.
pub type StoredMetadata = BTreeMap<String, String>;

/// One stored vector with its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub content: String,
    pub metadata: StoredMetadata,
    pub embedding: Vec<f32>,
}

/// A ranked hit from the retrieval index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: StoredMetadata,
    /// `1 - distance`; higher is more similar.
    pub similarity: f64,
    pub distance: f64,
    /// Present only after [`crate::index::RetrievalIndex::rerank`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

/// Urgency of a follow-up suggestion. Orders `High < Medium < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    FollowUp,
    ThankYou,
    Response,
}

/// A suggested next action derived from the classified inbox.
#[derive(Debug, Clone, Serialize)]
pub struct FollowUp {
    pub kind: FollowUpKind,
    pub priority: Priority,
    pub action: String,
    pub email_subject: String,
    pub company: String,
    pub days_since: i64,
    pub reasoning: String,
}

/// Per-category counts and conversion rates.
///
/// Rates are percentages of `applications_sent`, rounded to one decimal,
/// and 0 when nothing was sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressMetrics {
    pub applications_sent: usize,
    pub responses_received: usize,
    pub interviews_scheduled: usize,
    pub offers_received: usize,
    pub rejections_received: usize,
    pub response_rate_percent: f64,
    pub interview_rate_percent: f64,
    pub offer_rate_percent: f64,
}

/// Job-search metrics over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub period_days: i64,
    pub total_emails: usize,
    pub categories: BTreeMap<String, usize>,
    pub unique_companies: usize,
    pub metrics: ProgressMetrics,
    /// At most ten, sorted.
    pub companies_contacted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_first() {
        let mut ps = vec![Priority::Low, Priority::High, Priority::Medium];
        ps.sort();
        assert_eq!(ps, vec![Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn category_labels_round_trip() {
        for c in Category::ALL {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::parse("  interview "), Some(Category::Interview));
        assert_eq!(Category::parse("Ghosted"), None);
    }

    #[test]
    fn category_serializes_as_label() {
        let json = serde_json::to_string(&Category::ApplicationSent).unwrap();
        assert_eq!(json, "\"Application Sent\"");
    }

    #[test]
    fn result_construction_clamps_and_truncates() {
        let long = "x".repeat(500);
        let r = ClassificationResult::new(
            Category::Offer,
            1.7,
            &long,
            serde_json::Map::new(),
            ClassificationSource::Model,
        );
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.summary.chars().count(), 200);

        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn failed_result_is_degraded() {
        let r = ClassificationResult::failed("connection refused");
        assert_eq!(r.category, Category::Other);
        assert_eq!(r.confidence, 0.0);
        assert!(r.summary.starts_with("Classification error:"));
        assert!(r.is_degraded());
    }

    #[test]
    fn meta_values_flatten() {
        assert_eq!(MetaValue::from(3i64).to_metadata_string().as_deref(), Some("3"));
        assert_eq!(MetaValue::from(true).to_metadata_string().as_deref(), Some("true"));
        assert_eq!(MetaValue::from(None::<String>).to_metadata_string(), None);
    }
}
