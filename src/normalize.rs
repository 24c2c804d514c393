//! Export normalization: raw bytes to [`CanonicalEmail`] records.
//!
//! ```text
//! bytes ─▶ parse_json / parse_eml ─▶ EmailDraft ─▶ canonicalize ─▶ CanonicalEmail
//!                                       (per record; failures logged + dropped)
//! ```
//!
//! [`deduplicate`] and [`filter_relevant`] run afterwards on the whole batch.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clean::{
    clean_content, company_from_address, is_job_related, parse_date, parse_sender,
    truncate_chars,
};
use crate::error::NormalizeError;
use crate::models::CanonicalEmail;
use crate::{parse_eml, parse_json};

/// Characters kept when a snippet has to be derived from the body.
const SNIPPET_CHARS: usize = 200;

/// Declared format of an uploaded export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Eml,
    Mbox,
}

impl ExportFormat {
    /// Guess from a file extension; `None` for anything unrecognised.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "eml" => Some(ExportFormat::Eml),
            "mbox" => Some(ExportFormat::Mbox),
            _ => None,
        }
    }
}

impl FromStr for ExportFormat {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExportFormat::from_extension(s.trim()).ok_or_else(|| NormalizeError::Unsupported(s.to_string()))
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Json => "json",
            ExportFormat::Eml => "eml",
            ExportFormat::Mbox => "mbox",
        })
    }
}

/// Fields pulled out of one raw message, before cleaning.
#[derive(Debug, Clone, Default)]
pub struct EmailDraft {
    pub external_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub snippet: String,
    pub body: String,
    pub date: String,
    /// Provider-side timestamp used when `date` does not parse.
    pub fallback_received_at: Option<DateTime<Utc>>,
    pub thread_id: String,
    pub labels: Vec<String>,
}

/// Result of [`normalize_at`]: the records that made it plus what was dropped.
#[derive(Debug, Default)]
pub struct Normalized {
    pub emails: Vec<CanonicalEmail>,
    /// `(record position, reason)` for every record that failed.
    pub failures: Vec<(usize, NormalizeError)>,
}

/// Decode an export into canonical records, dropping malformed ones.
pub fn normalize(raw: &[u8], format: ExportFormat, account: &str) -> Vec<CanonicalEmail> {
    normalize_at(raw, format, account, Utc::now()).emails
}

/// As [`normalize`], with an explicit ingestion time and failure report.
pub fn normalize_at(
    raw: &[u8],
    format: ExportFormat,
    account: &str,
    now: DateTime<Utc>,
) -> Normalized {
    let drafts: Vec<Result<EmailDraft, NormalizeError>> = match format {
        ExportFormat::Json => match parse_json::parse_export(raw) {
            Ok(drafts) => drafts,
            Err(e) => {
                warn!(error = %e, "export could not be decoded");
                return Normalized {
                    emails: Vec::new(),
                    failures: vec![(0, e)],
                };
            }
        },
        ExportFormat::Eml => vec![parse_eml::parse_eml(raw)],
        ExportFormat::Mbox => parse_eml::parse_mbox(raw),
    };

    let mut out = Normalized::default();
    for (position, draft) in drafts.into_iter().enumerate() {
        match draft.and_then(|d| canonicalize(d, account, now)) {
            Ok(email) => out.emails.push(email),
            Err(e) => {
                warn!(position, error = %e, "skipping malformed record");
                out.failures.push((position, e));
            }
        }
    }

    info!(
        format = %format,
        account,
        accepted = out.emails.len(),
        skipped = out.failures.len(),
        "normalized export"
    );
    out
}

/// Turn a draft into a canonical record.
pub fn canonicalize(
    draft: EmailDraft,
    account: &str,
    now: DateTime<Utc>,
) -> Result<CanonicalEmail, NormalizeError> {
    let external_id = draft.external_id.trim().to_string();
    if external_id.is_empty() {
        return Err(NormalizeError::MissingId);
    }

    let received_at = match parse_date(&draft.date).or(draft.fallback_received_at) {
        Some(ts) => ts,
        None => {
            debug!(id = %external_id, date = %draft.date, "unparseable date, using ingestion time");
            now
        }
    };

    let sender_info = parse_sender(&draft.from);
    let company = company_from_address(&sender_info.address);
    let body = clean_content(&draft.body);
    let snippet = match clean_content(&draft.snippet) {
        s if s.is_empty() => truncate_chars(&body, SNIPPET_CHARS),
        s => s,
    };
    let subject = match draft.subject.trim() {
        "" => "No Subject".to_string(),
        s => s.to_string(),
    };
    let recipient = match draft.to.trim() {
        "" => account.to_string(),
        to => to.to_string(),
    };

    Ok(CanonicalEmail {
        external_id,
        account: account.to_string(),
        subject,
        sender: draft.from.trim().to_string(),
        sender_info,
        recipient,
        snippet,
        body,
        received_at,
        thread_id: draft.thread_id,
        labels: draft.labels,
        company,
    })
}

/// Batch after [`deduplicate`], with the size change.
#[derive(Debug)]
pub struct Deduplicated {
    pub records: Vec<CanonicalEmail>,
    pub input_count: usize,
    pub output_count: usize,
}

impl Deduplicated {
    pub fn removed(&self) -> usize {
        self.input_count - self.output_count
    }
}

/// Stable, first-seen-wins removal of repeated external ids.
pub fn deduplicate(records: Vec<CanonicalEmail>) -> Deduplicated {
    let input_count = records.len();
    let mut seen = HashSet::with_capacity(input_count);
    let records: Vec<CanonicalEmail> = records
        .into_iter()
        .filter(|r| seen.insert(r.external_id.clone()))
        .collect();
    let output_count = records.len();

    if output_count < input_count {
        info!(input_count, output_count, "removed duplicate emails");
    }
    Deduplicated {
        records,
        input_count,
        output_count,
    }
}

/// Keep records that look job-search related.
///
/// A cheap pre-filter in front of model classification, not a substitute
/// for it.
pub fn filter_relevant(records: Vec<CanonicalEmail>) -> Vec<CanonicalEmail> {
    let before = records.len();
    let kept: Vec<CanonicalEmail> = records
        .into_iter()
        .filter(|r| is_job_related(&r.subject, &r.sender, &r.snippet))
        .collect();
    debug!(before, after = kept.len(), "relevance filter");
    kept
}

/// Required fields are present and non-empty.
pub fn validate(email: &CanonicalEmail) -> bool {
    [
        &email.external_id,
        &email.account,
        &email.subject,
        &email.sender,
    ]
    .iter()
    .all(|f| !f.trim().is_empty())
}
