#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

use jobtrail::classify::{ClassificationChain, ClassifySettings};
use jobtrail::embedding::EmbeddingProvider;
use jobtrail::error::InferenceError;
use jobtrail::index::RetrievalIndex;
use jobtrail::inference::{GenerateRequest, Generator, InferenceClient};
use jobtrail::store::memory::InMemoryVectorStore;

pub const DIMS: usize = 64;

/// Answers prompts by looking at the email text embedded in them.
///
/// - "interview" → JSON Interview
/// - "offer" → prose (exercises the keyword fallback)
/// - "EXPLODE" → HTTP 500
/// - question prompts → a canned answer naming how many emails it saw
/// - anything else → JSON Other
#[derive(Default)]
pub struct ScriptedGenerator {
    pub calls: AtomicUsize,
}

fn email_section(prompt: &str) -> &str {
    let start = prompt
        .find("Email to classify:")
        .map(|i| i + "Email to classify:".len())
        .unwrap_or(0);
    let end = prompt[start..]
        .find("Provide your response")
        .map(|i| start + i)
        .unwrap_or(prompt.len());
    &prompt[start..end]
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(vec!["phi3:mini".to_string()])
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.prompt.as_str();

        if prompt.starts_with("Based on the following emails") {
            let n = prompt
                .split("Emails:\n")
                .nth(1)
                .map(|ctx| ctx.split("\n\n").filter(|s| !s.trim().is_empty()).count())
                .unwrap_or(0);
            return Ok(format!("You have {} relevant emails.", n));
        }

        let email = email_section(prompt).to_lowercase();
        if email.contains("explode") {
            return Err(InferenceError::Status {
                code: 500,
                body: "model crashed".to_string(),
            });
        }
        if email.contains("interview") {
            return Ok(json!({
                "category": "Interview",
                "confidence": 0.9,
                "summary": "Interview invitation",
                "key_info": {"company": "Initech"}
            })
            .to_string());
        }
        if email.contains("offer") {
            return Ok("This looks like an offer to me.".to_string());
        }
        Ok(json!({
            "category": "Other",
            "confidence": 0.6,
            "summary": "Not job related",
            "key_info": {}
        })
        .to_string())
    }
}

/// Hashes lowercase words into `DIMS` buckets.
pub struct BagOfWords;

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let h = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        v[h % DIMS] += 1.0;
    }
    v
}

pub fn chain(generator: Arc<ScriptedGenerator>) -> Arc<ClassificationChain> {
    let llm = InferenceClient::new(generator, "mistral:7b", "phi3:mini");
    Arc::new(ClassificationChain::new(
        Arc::new(llm),
        ClassifySettings::default(),
    ))
}

pub fn memory_index() -> Arc<RetrievalIndex> {
    Arc::new(
        RetrievalIndex::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(BagOfWords),
            "test_emails",
            100,
        )
        .unwrap(),
    )
}

/// One message in the JSON export shape.
pub fn api_message(id: &str, subject: &str, from: &str, date: &str, body: &str) -> Value {
    json!({
        "id": id,
        "threadId": format!("t-{}", id),
        "labelIds": ["INBOX"],
        "snippet": "",
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "Subject", "value": subject},
                {"name": "From", "value": from},
                {"name": "To", "value": "me@example.com"},
                {"name": "Date", "value": date}
            ],
            "body": {"data": URL_SAFE_NO_PAD.encode(body.as_bytes())}
        }
    })
}

pub fn export(messages: Vec<Value>) -> Vec<u8> {
    serde_json::to_vec(&json!({ "messages": messages })).unwrap()
}
