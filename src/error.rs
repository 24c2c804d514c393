//! Typed errors for the component seams.
//!
//! Command-level code uses `anyhow`; these enums are what the inference
//! backend, the vector/email stores, and the export decoders return so that
//! callers can match on the failure kind (retry, skip, alert).

use thiserror::Error;

/// Failures talking to the text-generation endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference endpoint returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("could not decode inference response: {0}")]
    Decode(String),

    #[error("no suitable model available")]
    NoModel,
}

/// Failures in the vector store or the structured email store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    Other(String),
}

/// Failures decoding a single raw export record.
///
/// Never escapes [`crate::normalize::normalize`]: the normalizer logs the
/// error, drops the record, and keeps going.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid JSON export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported export format: {0}")]
    Unsupported(String),

    #[error("record has no message id")]
    MissingId,

    #[error("malformed record: {0}")]
    Malformed(String),
}
