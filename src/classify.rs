//! Email classification over the inference client.
//!
//! ```text
//! Unclassified ──(model call)──┬─▶ validated   (source = model)
//!                              ├─▶ fallback    (source = keyword_fallback)
//!                              └─▶ failed      (source = failed, Other / 0.0)
//! ```
//!
//! Nothing here returns an error. Off-schema output is coerced, non-JSON
//! output goes through [`keyword_fallback`], and an unreachable model
//! yields [`ClassificationResult::failed`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::clean::truncate_chars;
use crate::config::Config;
use crate::inference::{
    extract_json_object, GenerateOptions, Generation, InferenceClient, StructuredResponse,
};
use crate::models::{Category, ClassificationResult, ClassificationSource};

const CLASSIFY_PROMPT: &str = "You are an expert at analyzing job-related emails. Your task is to classify emails and provide concise summaries.

Classify this email into one of these categories:
- Application Sent: Emails sent by the user applying for jobs
- Recruiter Response: Responses from recruiters or HR representatives
- Interview: Interview invitations, scheduling, or follow-ups
- Offer: Job offers or offer-related communications
- Rejection: Rejection letters or negative responses
- Other: Non-job-related or unclear emails

Email to classify:
{email_content}

Provide your response as a JSON object with:
- \"category\": one of the exact categories above
- \"confidence\": confidence score from 0.0 to 1.0
- \"summary\": one-line summary of the email's main point
- \"key_info\": any important details (company name, position, date, etc.)";

const CONTACT_PROMPT: &str = "Extract contact information from this email:

{email_content}

Please extract and return as JSON:
- company_name: company name if mentioned
- contact_person: name of person sending/mentioned
- job_title: job position if mentioned
- location: job location if mentioned
- salary_range: salary information if mentioned
- next_steps: any mentioned next steps or deadlines";

/// Email text sent for contact extraction.
const CONTACT_CONTENT_CHARS: usize = 1000;

/// Raw answer text kept as the summary of a fallback classification.
const FALLBACK_SUMMARY_CHARS: usize = 100;

const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Confidence assumed when the model omits it.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Keyword rules for non-JSON answers, in priority order. First match wins.
pub const FALLBACK_RULES: &[(Category, &[&str])] = &[
    (Category::ApplicationSent, &["application", "applied", "applying"]),
    (Category::RecruiterResponse, &["recruiter", "hr", "hiring"]),
    (Category::Interview, &["interview", "meeting", "call"]),
    (Category::Offer, &["offer", "congratulations", "pleased to offer"]),
    (Category::Rejection, &["reject", "unfortunately", "not selected"]),
];

#[derive(Debug, Clone)]
pub struct ClassifySettings {
    pub max_content_chars: usize,
    pub summary_max_chars: usize,
    pub max_concurrent: usize,
}

impl Default for ClassifySettings {
    fn default() -> Self {
        Self {
            max_content_chars: 2000,
            summary_max_chars: ClassificationResult::SUMMARY_MAX_CHARS,
            max_concurrent: 3,
        }
    }
}

impl ClassifySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_content_chars: config.classify.max_content_chars,
            summary_max_chars: config
                .classify
                .summary_max_chars
                .min(ClassificationResult::SUMMARY_MAX_CHARS),
            max_concurrent: config.inference.max_concurrent,
        }
    }
}

/// Details pulled out of an email by [`ClassificationChain::extract_contact_info`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactInfo {
    pub company_name: Option<String>,
    pub contact_person: Option<String>,
    pub job_title: Option<String>,
    pub location: Option<String>,
    pub salary_range: Option<String>,
    pub next_steps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ClassificationChain {
    llm: Arc<InferenceClient>,
    settings: ClassifySettings,
}

impl ClassificationChain {
    pub fn new(llm: Arc<InferenceClient>, settings: ClassifySettings) -> Self {
        Self { llm, settings }
    }

    pub fn llm(&self) -> &InferenceClient {
        &self.llm
    }

    fn prompt_for(&self, content: &str) -> String {
        CLASSIFY_PROMPT.replace(
            "{email_content}",
            &truncate_chars(content, self.settings.max_content_chars),
        )
    }

    /// Classify one email. Never fails.
    pub async fn classify(&self, content: &str) -> ClassificationResult {
        let schema = json!({
            "category": "string",
            "confidence": "number",
            "summary": "string",
            "key_info": "object",
        });
        let response = self
            .llm
            .generate_structured(&self.prompt_for(content), &schema, &GenerateOptions::default())
            .await;

        match response {
            StructuredResponse::Parsed(map) => {
                self.validate_classification(&map, ClassificationSource::Model)
            }
            // The model answered, just not in JSON.
            StructuredResponse::Failed { raw_excerpt, .. } if !raw_excerpt.trim().is_empty() => {
                warn!("structured classification unparseable, using keyword fallback");
                keyword_fallback(&raw_excerpt)
            }
            StructuredResponse::Failed { error, .. } => {
                warn!(error = %error, "classification failed");
                ClassificationResult::failed(&truncate_chars(&error, 100))
            }
        }
    }

    /// Classify many emails with bounded concurrency, one result per input.
    pub async fn batch_classify(&self, contents: &[String]) -> Vec<ClassificationResult> {
        let prompts: Vec<String> = contents.iter().map(|c| self.prompt_for(c)).collect();
        let options = GenerateOptions::default();
        let generations = self
            .llm
            .batch_generate(&prompts, self.settings.max_concurrent, &options)
            .await;

        generations
            .into_iter()
            .enumerate()
            .map(|(index, generation)| match generation {
                Generation::Text(raw) => match extract_json_object(&raw) {
                    Some(map) => self.validate_classification(&map, ClassificationSource::Model),
                    None => {
                        debug!(index, "batch result is not JSON, using keyword fallback");
                        keyword_fallback(&raw)
                    }
                },
                Generation::Failed(error) => {
                    warn!(index, error = %error, "batch classification unit failed");
                    ClassificationResult::failed(&truncate_chars(&error, 100))
                }
            })
            .collect()
    }

    /// Coerce a model's JSON answer into a valid result.
    ///
    /// Unknown categories become `Other` (logged), confidence is clamped,
    /// the summary is bounded, and `key_info` is forced into an object.
    pub fn validate_classification(
        &self,
        answer: &Map<String, Value>,
        source: ClassificationSource,
    ) -> ClassificationResult {
        let category = match answer.get("category").and_then(Value::as_str) {
            Some(label) => Category::parse(label).unwrap_or_else(|| {
                warn!(category = label, "unknown category, defaulting to Other");
                Category::Other
            }),
            None => {
                warn!("answer has no category, defaulting to Other");
                Category::Other
            }
        };

        let confidence = match answer.get("confidence") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(DEFAULT_CONFIDENCE),
            _ => DEFAULT_CONFIDENCE,
        };

        let summary = match answer.get("summary").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => "No summary available".to_string(),
        };
        let summary = truncate_chars(&summary, self.settings.summary_max_chars);

        let key_info = match answer.get("key_info") {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(Value::String(s)) if s.trim().is_empty() => Map::new(),
            Some(Value::String(s)) => {
                let mut map = Map::new();
                map.insert("details".to_string(), Value::String(s.clone()));
                map
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert("details".to_string(), other.clone());
                map
            }
        };

        ClassificationResult::new(category, confidence, &summary, key_info, source)
    }

    /// Pull company/contact/role details out of an email.
    pub async fn extract_contact_info(&self, content: &str) -> ContactInfo {
        let prompt = CONTACT_PROMPT.replace(
            "{email_content}",
            &truncate_chars(content, CONTACT_CONTENT_CHARS),
        );
        let schema = json!({
            "company_name": "string or null",
            "contact_person": "string or null",
            "job_title": "string or null",
            "location": "string or null",
            "salary_range": "string or null",
            "next_steps": "string or null",
        });

        match self
            .llm
            .generate_structured(&prompt, &schema, &GenerateOptions::default())
            .await
        {
            StructuredResponse::Parsed(map) => {
                let field = |name: &str| match map.get(name) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) if s.trim().is_empty() => None,
                    Some(Value::String(s)) => Some(s.trim().to_string()),
                    Some(other) => Some(other.to_string()),
                };
                ContactInfo {
                    company_name: field("company_name"),
                    contact_person: field("contact_person"),
                    job_title: field("job_title"),
                    location: field("location"),
                    salary_range: field("salary_range"),
                    next_steps: field("next_steps"),
                    error: None,
                }
            }
            StructuredResponse::Failed { error, .. } => {
                warn!(error = %error, "contact extraction failed");
                ContactInfo {
                    error: Some(error),
                    ..Default::default()
                }
            }
        }
    }
}

/// Deterministic classification of a free-text model answer.
///
/// Keywords match at the start of a word, so `hr` matches "HR team" but
/// not "three", and `reject` matches "rejected".
pub fn keyword_fallback(raw: &str) -> ClassificationResult {
    let lower = raw.to_lowercase();
    let category = FALLBACK_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| contains_word_prefix(&lower, kw)))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Other);

    ClassificationResult::new(
        category,
        FALLBACK_CONFIDENCE,
        &truncate_chars(raw.trim(), FALLBACK_SUMMARY_CHARS),
        Map::new(),
        ClassificationSource::KeywordFallback,
    )
}

fn contains_word_prefix(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(idx, _)| {
        haystack[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}
