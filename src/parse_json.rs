//! Structured (API-style) export decoding.
//!
//! Accepts the shapes a mail provider's JSON export comes in:
//!
//! - `{"messages": [ ... ]}`
//! - a bare array of messages
//! - a single message object
//!
//! Each message carries `payload.headers` as a name/value list and its body
//! either as one URL-safe base64 block (`payload.body.data`) or as a tree of
//! `parts`. Messages are decoded independently so one broken message only
//! costs itself.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::clean::{decode_utf8_lossy_drop, strip_html};
use crate::error::NormalizeError;
use crate::normalize::EmailDraft;
use crate::parse_eml::decode_encoded_words;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    /// Epoch milliseconds, serialized as a string.
    #[serde(default)]
    internal_date: Option<Value>,
    #[serde(default)]
    payload: Option<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

/// Split an export document into per-message decode results.
///
/// Only a document that is not JSON at all fails as a whole.
pub fn parse_export(raw: &[u8]) -> Result<Vec<Result<EmailDraft, NormalizeError>>, NormalizeError> {
    let doc: Value = serde_json::from_slice(raw)?;

    let messages = match doc {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(NormalizeError::Malformed(
                    "\"messages\" is not an array".to_string(),
                ))
            }
            None => vec![Value::Object(map)],
        },
        other => {
            return Err(NormalizeError::Malformed(format!(
                "expected object or array, found {}",
                json_kind(&other)
            )))
        }
    };

    Ok(messages.into_iter().map(parse_message).collect())
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode one message object.
pub fn parse_message(value: Value) -> Result<EmailDraft, NormalizeError> {
    let message: ApiMessage = serde_json::from_value(value)?;
    if message.id.trim().is_empty() {
        return Err(NormalizeError::MissingId);
    }

    let payload = message.payload.unwrap_or_default();
    let header = |name: &str| -> String {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    Ok(EmailDraft {
        external_id: message.id.trim().to_string(),
        subject: decode_encoded_words(&header("Subject")),
        from: decode_encoded_words(&header("From")),
        to: decode_encoded_words(&header("To")),
        snippet: message.snippet.clone(),
        body: extract_body(&payload),
        date: header("Date"),
        fallback_received_at: message.internal_date.as_ref().and_then(epoch_millis),
        thread_id: message.thread_id,
        labels: message.label_ids,
    })
}

fn epoch_millis(v: &Value) -> Option<DateTime<Utc>> {
    let millis = match v {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

/// Plain-text leaves win; HTML leaves are a tag-stripped fallback.
fn extract_body(payload: &Part) -> String {
    let mut plain = Vec::new();
    let mut html = Vec::new();
    collect_text_leaves(payload, &mut plain, &mut html);

    let pick = if plain.iter().any(|t| !t.trim().is_empty()) {
        plain
    } else {
        html.iter().map(|h| strip_html(h)).collect()
    };
    pick.join("\n")
}

fn collect_text_leaves(part: &Part, plain: &mut Vec<String>, html: &mut Vec<String>) {
    if !part.parts.is_empty() {
        for child in &part.parts {
            collect_text_leaves(child, plain, html);
        }
        return;
    }

    let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) else {
        return;
    };
    let mime = part.mime_type.to_ascii_lowercase();
    // A top-level body without a declared type is treated as plain text.
    if !(mime.is_empty() || mime.starts_with("text/")) {
        return;
    }
    let Some(bytes) = decode_base64(data) else {
        tracing::debug!(mime = %mime, "skipping undecodable body part");
        return;
    };
    let text = decode_utf8_lossy_drop(&bytes);
    if mime == "text/html" {
        html.push(text);
    } else {
        plain.push(text);
    }
}

/// URL-safe base64 with optional padding, falling back to the standard
/// alphabet for exports that re-encode bodies.
pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let compact: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect();
    URL_SAFE_NO_PAD
        .decode(compact.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(compact.as_bytes()))
        .ok()
}
