//! Text-generation client.
//!
//! Two layers:
//!
//! - **[`Generator`]**: the raw endpoint seam. [`OllamaBackend`] talks to a
//!   local Ollama server over HTTP; tests plug in scripted doubles.
//! - **[`InferenceClient`]**: model selection (primary, then backup),
//!   per-model decoding defaults, structured JSON extraction, and
//!   bounded-concurrency batches.
//!
//! # Failure model
//!
//! `InferenceClient` never returns `Err`. Endpoint failures become
//! [`Generation::Failed`], unparseable structured output becomes
//! [`StructuredResponse::Failed`], and an unreachable endpoint is a
//! [`HealthStatus`] value. Batch jobs keep going when one unit fails.
//!
//! # Endpoint
//!
//! | Call | Ollama route |
//! |------|--------------|
//! | list models | `GET /api/tags` |
//! | generate | `POST /api/generate` (`stream: false`) |
//! | pull | `POST /api/pull` (NDJSON status stream) |
//! | model info | `POST /api/show` |

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::clean::truncate_chars;
use crate::config::InferenceConfig;
use crate::error::InferenceError;

/// Characters of a bad structured response kept for diagnosis.
const RAW_EXCERPT_CHARS: usize = 500;

/// Temperature used for schema-constrained requests.
const STRUCTURED_TEMPERATURE: f32 = 0.2;

// ============ Decoding options ============

/// Sampling parameters sent as Ollama's `options` object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodingOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: u32,
    pub stop: Vec<String>,
}

/// Built-in defaults for the models this tool is tuned for.
///
/// Unknown models get the `mistral:7b` settings.
pub fn model_defaults(model: &str) -> DecodingOptions {
    let (temperature, top_p, num_predict, stop): (f32, f32, u32, &[&str]) = match model {
        "phi3:mini" => (0.4, 0.8, 1024, &["<|end|>", "\n\n\n"]),
        "llama3.2:3b" => (0.3, 0.9, 2048, &["<|eot_id|>", "\n\n\n"]),
        _ => (0.3, 0.9, 2048, &["Human:", "Assistant:", "\n\n\n"]),
    };
    DecodingOptions {
        temperature,
        top_p,
        num_predict,
        stop: stop.iter().map(|s| s.to_string()).collect(),
    }
}

/// Per-call overrides. Unset fields fall back to [`model_defaults`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

impl GenerateOptions {
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Merge over the defaults for `model`.
    pub fn decoding_for(&self, model: &str) -> DecodingOptions {
        let mut opts = model_defaults(model);
        if let Some(t) = self.temperature {
            opts.temperature = t;
        }
        if let Some(p) = self.top_p {
            opts.top_p = p;
        }
        if let Some(n) = self.max_tokens {
            opts.num_predict = n;
        }
        if let Some(stop) = &self.stop {
            opts.stop = stop.clone();
        }
        opts
    }
}

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: DecodingOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

// ============ Backend seam ============

/// A text-generation endpoint.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Names of the models the endpoint can serve right now.
    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;

    /// Single non-streaming completion.
    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError>;

    /// Download a model, returning the status lines reported along the way.
    async fn pull_model(&self, _name: &str) -> Result<Vec<String>, InferenceError> {
        Err(InferenceError::Decode(
            "this backend does not support pulling models".to_string(),
        ))
    }

    /// Backend-specific model details.
    async fn model_info(&self, _name: &str) -> Result<Value, InferenceError> {
        Err(InferenceError::Decode(
            "this backend does not report model details".to_string(),
        ))
    }
}

/// HTTP client for a local Ollama server.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(InferenceError::Status {
            code: status.as_u16(),
            body: truncate_chars(&body, RAW_EXCERPT_CHARS),
        })
    }
}

#[async_trait]
impl Generator for OllamaBackend {
    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let response = self.client.get(self.url("/api/tags")).send().await?;
        let tags: TagsResponse = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(request)
            .send()
            .await?;
        let body: GenerateResponse = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(body.response)
    }

    async fn pull_model(&self, name: &str) -> Result<Vec<String>, InferenceError> {
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .send()
            .await?;
        let mut response = Self::checked(response).await?;

        let mut statuses = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                record_pull_line(name, &line, &mut statuses)?;
            }
        }
        if !pending.is_empty() {
            record_pull_line(name, &pending, &mut statuses)?;
        }
        Ok(statuses)
    }

    async fn model_info(&self, name: &str) -> Result<Value, InferenceError> {
        let response = self
            .client
            .post(self.url("/api/show"))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))
    }
}

fn record_pull_line(
    model: &str,
    line: &[u8],
    statuses: &mut Vec<String>,
) -> Result<(), InferenceError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let status: PullStatus =
        serde_json::from_str(line).map_err(|e| InferenceError::Decode(e.to_string()))?;
    if let Some(err) = status.error {
        return Err(InferenceError::Decode(err));
    }
    info!(model, status = %status.status, "pull");
    statuses.push(status.status);
    Ok(())
}

// ============ Result values ============

/// Outcome of a free-text generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Text(String),
    /// Endpoint or transport failure, with the reason.
    Failed(String),
}

impl Generation {
    pub fn is_failed(&self) -> bool {
        matches!(self, Generation::Failed(_))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Text(t) => f.write_str(t),
            Generation::Failed(e) => write!(f, "Error: {}", e),
        }
    }
}

/// Outcome of a schema-constrained generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredResponse {
    Parsed(Map<String, Value>),
    Failed {
        error: String,
        /// Start of the raw model output, empty when generation itself failed.
        raw_excerpt: String,
    },
}

impl StructuredResponse {
    pub fn is_parsed(&self) -> bool {
        matches!(self, StructuredResponse::Parsed(_))
    }

    /// JSON form: the object itself, or `{error, raw_response, parsed: false}`.
    pub fn to_json(&self) -> Value {
        match self {
            StructuredResponse::Parsed(map) => Value::Object(map.clone()),
            StructuredResponse::Failed { error, raw_excerpt } => serde_json::json!({
                "error": error,
                "raw_response": raw_excerpt,
                "parsed": false,
            }),
        }
    }
}

/// Endpoint health as seen by the last probe.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy { model: String },
    UsingBackup { model: String },
    NoSuitableModel { available: Vec<String> },
    NotResponding { code: u16 },
    Error(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            HealthStatus::Healthy { .. } | HealthStatus::UsingBackup { .. }
        )
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy { model } => write!(f, "healthy - using {}", model),
            HealthStatus::UsingBackup { model } => write!(f, "healthy - using backup {}", model),
            HealthStatus::NoSuitableModel { available } => {
                write!(f, "no suitable models - available: [{}]", available.join(", "))
            }
            HealthStatus::NotResponding { code } => write!(f, "ollama not responding ({})", code),
            HealthStatus::Error(e) => write!(f, "error - {}", e),
        }
    }
}

/// A turn in a chat-style exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

// ============ Client ============

/// Stateful client over one [`Generator`].
///
/// Holds the selected model, which [`InferenceClient::health_check`]
/// updates. Everything else is stateless per call.
pub struct InferenceClient {
    backend: Arc<dyn Generator>,
    primary_model: String,
    backup_model: String,
    current_model: RwLock<String>,
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn Generator>, primary_model: &str, backup_model: &str) -> Self {
        Self {
            backend,
            primary_model: primary_model.to_string(),
            backup_model: backup_model.to_string(),
            current_model: RwLock::new(primary_model.to_string()),
        }
    }

    /// Ollama-backed client from `[inference]` settings.
    pub fn from_config(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let backend = OllamaBackend::new(&config.url, Duration::from_secs(config.timeout_secs))?;
        Ok(Self::new(
            Arc::new(backend),
            &config.primary_model,
            &config.backup_model,
        ))
    }

    /// Model used when a call does not name one.
    pub fn current_model(&self) -> String {
        match self.current_model.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current_model(&self, model: &str) {
        let mut guard = match self.current_model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = model.to_string();
    }

    /// Probe the endpoint and select primary, then backup.
    ///
    /// A missing model or a dead endpoint is reported, never raised.
    pub async fn health_check(&self) -> HealthStatus {
        let status = match self.backend.list_models().await {
            Ok(models) => {
                if models.iter().any(|m| m == &self.primary_model) {
                    self.set_current_model(&self.primary_model);
                    HealthStatus::Healthy {
                        model: self.primary_model.clone(),
                    }
                } else if models.iter().any(|m| m == &self.backup_model) {
                    self.set_current_model(&self.backup_model);
                    HealthStatus::UsingBackup {
                        model: self.backup_model.clone(),
                    }
                } else {
                    HealthStatus::NoSuitableModel { available: models }
                }
            }
            Err(InferenceError::Status { code, .. }) => HealthStatus::NotResponding { code },
            Err(e) => HealthStatus::Error(e.to_string()),
        };

        if status.is_healthy() {
            debug!(status = %status, "inference health");
        } else {
            warn!(status = %status, "inference endpoint degraded");
        }
        status
    }

    pub async fn list_models(&self) -> Vec<String> {
        match self.backend.list_models().await {
            Ok(models) => models,
            Err(e) => {
                error!(error = %e, "failed to list models");
                Vec::new()
            }
        }
    }

    /// Returns `true` once the endpoint reports the pull finished.
    pub async fn pull_model(&self, name: &str) -> bool {
        info!(model = name, "pulling model");
        match self.backend.pull_model(name).await {
            Ok(statuses) => {
                info!(model = name, steps = statuses.len(), "pull complete");
                true
            }
            Err(e) => {
                error!(model = name, error = %e, "pull failed");
                false
            }
        }
    }

    pub async fn model_info(&self, name: &str) -> Option<Value> {
        match self.backend.model_info(name).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(model = name, error = %e, "model info unavailable");
                None
            }
        }
    }

    /// Free-text generation. Failures come back as [`Generation::Failed`].
    pub async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Generation {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.current_model());
        let request = GenerateRequest {
            options: options.decoding_for(&model),
            model,
            prompt: prompt.to_string(),
            stream: false,
            system: options.system.clone(),
        };

        let started = Instant::now();
        match self.backend.generate(&request).await {
            Ok(text) => {
                info!(
                    model = %request.model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    approx_tokens = text.split_whitespace().count(),
                    "generation complete"
                );
                Generation::Text(text.trim().to_string())
            }
            Err(e) => {
                error!(model = %request.model, error = %e, "generation failed");
                Generation::Failed(e.to_string())
            }
        }
    }

    /// Ask for JSON matching `schema` and extract it from whatever comes back.
    pub async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerateOptions,
    ) -> StructuredResponse {
        let schema_text =
            serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        let full_prompt = format!(
            "{}\n\nPlease respond with valid JSON matching this schema:\n{}\n\nResponse (JSON only):",
            prompt, schema_text
        );
        let mut options = options.clone();
        options.temperature = options.temperature.or(Some(STRUCTURED_TEMPERATURE));

        match self.generate(&full_prompt, &options).await {
            Generation::Text(raw) => parse_structured(&raw),
            Generation::Failed(error) => StructuredResponse::Failed {
                error,
                raw_excerpt: String::new(),
            },
        }
    }

    /// Run `prompts` with at most `max_concurrent` in flight.
    ///
    /// Output order and length match the input; a failed prompt yields
    /// [`Generation::Failed`] at its own index.
    pub async fn batch_generate(
        &self,
        prompts: &[String],
        max_concurrent: usize,
        options: &GenerateOptions,
    ) -> Vec<Generation> {
        let gate = Semaphore::new(max_concurrent.max(1));
        let gate = &gate;

        let units = prompts.iter().enumerate().map(|(index, prompt)| async move {
            let _permit = match gate.acquire().await {
                Ok(permit) => permit,
                Err(e) => return Generation::Failed(e.to_string()),
            };
            let result = self.generate(prompt, options).await;
            if let Generation::Failed(e) = &result {
                warn!(index, error = %e, "batch unit failed");
            }
            result
        });

        let results = join_all(units).await;
        let failed = results.iter().filter(|r| r.is_failed()).count();
        info!(total = results.len(), failed, "batch generation finished");
        results
    }

    /// Flatten a conversation into a single prompt and generate the next turn.
    pub async fn chat(&self, messages: &[ChatMessage], options: &GenerateOptions) -> Generation {
        self.generate(&flatten_chat(messages), options).await
    }
}

/// `System:` / `Human:` / `Assistant:` transcript ending in an open
/// assistant turn.
pub fn flatten_chat(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .map(|m| {
            let label = match m.role {
                ChatRole::System => "System",
                ChatRole::User => "Human",
                ChatRole::Assistant => "Assistant",
            };
            format!("{}: {}", label, m.content)
        })
        .collect();
    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}

// ============ JSON extraction ============

/// Parse model output that should contain a JSON object.
pub fn parse_structured(raw: &str) -> StructuredResponse {
    match extract_json_object(raw) {
        Some(map) => StructuredResponse::Parsed(map),
        None => {
            warn!(
                excerpt = %truncate_chars(raw, 80),
                "model output did not contain a JSON object"
            );
            StructuredResponse::Failed {
                error: "Failed to parse JSON response".to_string(),
                raw_excerpt: truncate_chars(raw, RAW_EXCERPT_CHARS),
            }
        }
    }
}

/// First balanced `{...}` span that parses as an object.
///
/// Falls back to the widest span (first `{` to last `}`) for output whose
/// braces are unbalanced inside string values.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let as_object = |s: &str| match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    for (start, _) in raw.match_indices('{') {
        if let Some(span) = balanced_span(&raw[start..]) {
            if let Some(map) = as_object(span) {
                return Some(map);
            }
        }
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        as_object(&raw[start..=end])
    } else {
        None
    }
}

/// The prefix of `text` (which starts with `{`) up to its matching `}`.
fn balanced_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&GenerateRequest) -> Result<String, InferenceError> + Send + Sync>;

    struct Scripted {
        models: Result<Vec<String>, u16>,
        respond: Script,
        seen: Mutex<Vec<GenerateRequest>>,
    }

    impl Scripted {
        fn new(
            models: &[&str],
            respond: impl Fn(&GenerateRequest) -> Result<String, InferenceError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                models: Ok(models.iter().map(|m| m.to_string()).collect()),
                respond: Box::new(respond),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
            match &self.models {
                Ok(m) => Ok(m.clone()),
                Err(code) => Err(InferenceError::Status {
                    code: *code,
                    body: String::new(),
                }),
            }
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
            self.seen.lock().unwrap().push(request.clone());
            (self.respond)(request)
        }
    }

    fn client(backend: Scripted) -> (InferenceClient, Arc<Scripted>) {
        let backend = Arc::new(backend);
        let client = InferenceClient::new(backend.clone(), "mistral:7b", "phi3:mini");
        (client, backend)
    }

    #[test]
    fn defaults_per_model() {
        let phi = model_defaults("phi3:mini");
        assert_eq!(phi.num_predict, 1024);
        assert_eq!(phi.stop, vec!["<|end|>", "\n\n\n"]);

        let unknown = model_defaults("gemma:2b");
        assert_eq!(unknown, model_defaults("mistral:7b"));
        assert_eq!(unknown.temperature, 0.3);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let opts = GenerateOptions::default()
            .with_temperature(0.9)
            .with_max_tokens(64);
        let merged = opts.decoding_for("llama3.2:3b");
        assert_eq!(merged.temperature, 0.9);
        assert_eq!(merged.num_predict, 64);
        assert_eq!(merged.top_p, 0.9);
        assert_eq!(merged.stop, vec!["<|eot_id|>", "\n\n\n"]);
    }

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let raw = "Sure! Here you go: {\"category\": \"Interview\", \"confidence\": 1.7, \"summary\": \"...\"}  Let me know if you need more.";
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["category"], "Interview");
        assert_eq!(map["confidence"], 1.7);
    }

    #[test]
    fn extraction_handles_nesting_and_braces_in_strings() {
        let raw = r#"note {not json} then {"a": {"b": "x}y"}, "c": 1} trailing }"#;
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map["c"], 1);
        assert_eq!(map["a"]["b"], "x}y");
    }

    #[test]
    fn unparseable_output_is_a_typed_failure() {
        match parse_structured("I cannot answer that.") {
            StructuredResponse::Failed { raw_excerpt, .. } => {
                assert_eq!(raw_excerpt, "I cannot answer that.")
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let json = parse_structured("[1, 2]").to_json();
        assert_eq!(json["parsed"], false);
    }

    #[test]
    fn chat_flattening() {
        let prompt = flatten_chat(&[
            ChatMessage {
                role: ChatRole::System,
                content: "Be brief.".into(),
            },
            ChatMessage {
                role: ChatRole::User,
                content: "Hi".into(),
            },
        ]);
        assert_eq!(prompt, "System: Be brief.\n\nHuman: Hi\n\nAssistant:");
    }

    #[tokio::test]
    async fn health_selects_primary_then_backup() {
        let (c, _) = client(Scripted::new(&["mistral:7b", "phi3:mini"], |_| Ok(String::new())));
        assert_eq!(c.health_check().await.to_string(), "healthy - using mistral:7b");

        let (c, _) = client(Scripted::new(&["phi3:mini"], |_| Ok(String::new())));
        let status = c.health_check().await;
        assert_eq!(status.to_string(), "healthy - using backup phi3:mini");
        assert_eq!(c.current_model(), "phi3:mini");

        let (c, _) = client(Scripted::new(&["llava"], |_| Ok(String::new())));
        let status = c.health_check().await;
        assert!(!status.is_healthy());
        assert_eq!(status.to_string(), "no suitable models - available: [llava]");
    }

    #[tokio::test]
    async fn health_reports_dead_endpoint() {
        let mut backend = Scripted::new(&[], |_| Ok(String::new()));
        backend.models = Err(503);
        let (c, _) = client(backend);
        assert_eq!(c.health_check().await, HealthStatus::NotResponding { code: 503 });
    }

    #[tokio::test]
    async fn generate_failure_is_a_value() {
        let (c, _) = client(Scripted::new(&[], |_| {
            Err(InferenceError::Decode("boom".into()))
        }));
        let g = c.generate("hello", &GenerateOptions::default()).await;
        assert!(g.is_failed());
        assert!(g.to_string().starts_with("Error: "));
    }

    #[tokio::test]
    async fn chat_sends_flattened_transcript() {
        let (c, backend) = client(Scripted::new(&[], |_| Ok("  Sure.  ".into())));
        let opts = GenerateOptions::default()
            .with_model("llama3.2:3b")
            .with_system("You are terse.");
        let reply = c
            .chat(
                &[ChatMessage {
                    role: ChatRole::User,
                    content: "Summarize my week".into(),
                }],
                &opts,
            )
            .await;
        assert_eq!(reply, Generation::Text("Sure.".into()));

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].model, "llama3.2:3b");
        assert_eq!(seen[0].system.as_deref(), Some("You are terse."));
        assert_eq!(seen[0].prompt, "Human: Summarize my week\n\nAssistant:");
        assert_eq!(seen[0].options.stop, vec!["<|eot_id|>", "\n\n\n"]);
    }

    #[tokio::test]
    async fn structured_requests_use_low_temperature() {
        let (c, backend) = client(Scripted::new(&[], |_| Ok("{\"ok\": true}".into())));
        let schema = serde_json::json!({"ok": "boolean"});
        let r = c
            .generate_structured("check", &schema, &GenerateOptions::default())
            .await;
        assert!(r.is_parsed());

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].options.temperature, 0.2);
        assert!(seen[0].prompt.contains("Response (JSON only):"));
        assert_eq!(seen[0].model, "mistral:7b");
    }

    #[tokio::test]
    async fn batch_preserves_order_and_isolates_failures() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        struct Slow {
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Generator for Slow {
            async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
                Ok(vec![])
            }
            async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                // later prompts finish first
                let delay = 40 - request.prompt.len() as u64 * 5;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                if request.prompt == "xxx" {
                    return Err(InferenceError::Decode("bad unit".into()));
                }
                Ok(format!("echo {}", request.prompt))
            }
        }

        let c = InferenceClient::new(
            Arc::new(Slow {
                in_flight: in_flight.clone(),
                peak: peak.clone(),
            }),
            "mistral:7b",
            "phi3:mini",
        );
        let prompts: Vec<String> = ["a", "bb", "xxx", "dddd", "eeeee"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let results = c
            .batch_generate(&prompts, 2, &GenerateOptions::default())
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[0], Generation::Text("echo a".into()));
        assert!(results[2].is_failed());
        assert_eq!(results[4], Generation::Text("echo eeeee".into()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
